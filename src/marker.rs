//! Markers: zero-length companions named `<blob><MARKER_SUFFIX>` that record
//! a put which has not been reconciled yet.
//!
//! A marker is written before the real put and cleared only after a
//! reconciliation outcome has landed, so a crash between the two leaves the
//! marker behind for the next pass to find.

use crate::errors::{TierError, TierResult};
use crate::models::{Blob, Payload};
use crate::store::BlobStore;
use tracing::debug;

/// Suffix appended to a blob name to form its marker. The leading spaces
/// sort the marker directly after its base name.
pub const MARKER_SUFFIX: &str = "     bounce!log";

/// Prefix reserved for engine-internal objects.
pub const INTERNAL_PREFIX: &str = ".bounce internal reserved prefix/";

pub fn is_marker(name: &str) -> bool {
    name.ends_with(MARKER_SUFFIX)
}

/// Base name of a marker; non-marker names come back unchanged.
pub fn strip_suffix(name: &str) -> &str {
    name.strip_suffix(MARKER_SUFFIX).unwrap_or(name)
}

pub fn marker_name(name: &str) -> String {
    format!("{}{}", name, MARKER_SUFFIX)
}

/// Names clients may not read or write directly.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX) || is_marker(name)
}

pub fn ensure_client_name(name: &str) -> TierResult<()> {
    if is_reserved(name) {
        return Err(TierError::IllegalName(name.to_string()));
    }
    Ok(())
}

/// Write the marker for `name`. Returns only once the store has it.
pub async fn write_marker(store: &dyn BlobStore, container: &str, name: &str) -> TierResult<()> {
    let marker = marker_name(name);
    debug!("writing marker {}/{} to {}", container, marker, store.id());
    store
        .put_blob(container, Blob::from_bytes(marker, Payload::empty()))
        .await?;
    Ok(())
}

pub async fn clear_marker(store: &dyn BlobStore, container: &str, name: &str) -> TierResult<()> {
    debug!("clearing marker for {}/{} on {}", container, name, store.id());
    store.remove_blob(container, &marker_name(name)).await?;
    Ok(())
}

pub async fn has_marker(store: &dyn BlobStore, container: &str, name: &str) -> TierResult<bool> {
    Ok(store
        .blob_metadata(container, &marker_name(name))
        .await?
        .is_some())
}
