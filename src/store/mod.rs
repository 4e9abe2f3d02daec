//! The store capability the engine consumes.
//!
//! A [`BlobStore`] offers get/put/remove/list/metadata by
//! `(container, name)`. Two implementations ship with the crate:
//! [`TransientStore`] (in memory) and [`LocalStore`] (SQLite + disk).

pub mod local;
pub mod transient;

use crate::link::BounceLink;
use crate::models::{Blob, BlobMetadata};
use async_trait::async_trait;
use futures::{Stream, stream};
use std::{collections::VecDeque, io, sync::Arc};
use thiserror::Error;
use tracing::debug;

pub use local::LocalStore;
pub use transient::TransientStore;

/// Largest page a store hands back for one `list` call.
pub const MAX_LIST_KEYS: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("container `{name}` invalid: {reason}")]
    InvalidContainerName { name: String, reason: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Options for one page of a listing.
#[derive(Clone, Debug)]
pub struct ListOptions {
    pub prefix: Option<String>,
    /// Return only names strictly greater than this one.
    pub after: Option<String>,
    pub max_keys: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            after: None,
            max_keys: MAX_LIST_KEYS,
        }
    }
}

/// One page of a listing, in ascending byte order of name.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub entries: Vec<BlobMetadata>,
    /// Pass as `after` to fetch the next page; `None` on the last page.
    pub next_marker: Option<String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    async fn create_container(&self, container: &str) -> StoreResult<()>;

    /// Entries must come back in strictly ascending byte order of name, the
    /// order `str` comparison gives. The merge iterator relies on it and
    /// fails the pass with `UnsortedListing` when a store breaks it.
    async fn list(&self, container: &str, options: &ListOptions) -> StoreResult<ListPage>;

    async fn blob_metadata(&self, container: &str, name: &str)
    -> StoreResult<Option<BlobMetadata>>;

    async fn get_blob(&self, container: &str, name: &str) -> StoreResult<Option<Blob>>;

    /// Store `blob` under `container`, returning the new ETag.
    async fn put_blob(&self, container: &str, blob: Blob) -> StoreResult<String>;

    /// Remove a blob. Removing a missing blob is not an error.
    async fn remove_blob(&self, container: &str, name: &str) -> StoreResult<()>;
}

/// Stream every entry of a container, following continuation markers and
/// skipping directory placeholders. Holds at most one page in memory and
/// keeps the store's byte order, so a store listing out of order yields an
/// out-of-order stream.
pub fn crawl(
    store: Arc<dyn BlobStore>,
    container: &str,
    options: ListOptions,
) -> impl Stream<Item = StoreResult<BlobMetadata>> + Send + 'static {
    struct Crawl {
        store: Arc<dyn BlobStore>,
        container: String,
        options: ListOptions,
        page: VecDeque<BlobMetadata>,
        exhausted: bool,
    }

    let state = Crawl {
        store,
        container: container.to_string(),
        options,
        page: VecDeque::new(),
        exhausted: false,
    };

    stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(meta) = state.page.pop_front() {
                if meta.is_directory() {
                    debug!("skipping directory placeholder {}", meta.name);
                    continue;
                }
                return Ok(Some((meta, state)));
            }
            if state.exhausted {
                return Ok(None);
            }
            let page = state.store.list(&state.container, &state.options).await?;
            match page.next_marker {
                Some(marker) => state.options.after = Some(marker),
                None => state.exhausted = true,
            }
            state.page = page.entries.into();
        }
    })
}

/// Copy one blob between stores, preserving content fields and user
/// metadata. Returns the metadata of the copied source, or `None` when the
/// source is absent or is itself a BounceLink.
pub async fn copy_blob(
    from: &dyn BlobStore,
    to: &dyn BlobStore,
    container: &str,
    name: &str,
) -> StoreResult<Option<BlobMetadata>> {
    let Some(blob) = from.get_blob(container, name).await? else {
        return Ok(None);
    };
    if BounceLink::is_link(&blob.metadata) {
        return Ok(None);
    }

    debug!("copying {}/{} from {} to {}", container, name, from.id(), to.id());
    let source = blob.metadata;
    let copy = Blob::new(source.to_put_metadata(), blob.payload);
    to.put_blob(container, copy).await?;
    Ok(Some(source))
}
