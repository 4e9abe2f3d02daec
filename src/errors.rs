//! Error taxonomy for the tiering engine.
//!
//! Store-level failures surface as [`StoreError`] and are wrapped
//! transparently. Everything else maps onto one failure scope: a single
//! object, a single client request, or policy initialisation. Nothing here
//! is meant to take the process down.

use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TierError {
    /// Another operation holds the object; retry later.
    #[error("concurrent operation on `{container}/{name}`")]
    Unavailable { container: String, name: String },

    /// A BounceLink payload could not be decoded.
    #[error("corrupt bounce link for `{name}`: {reason}")]
    CorruptLink { name: String, reason: String },

    /// Missing or malformed policy configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was attempted before its preconditions held.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Client tried to touch a reserved name (internal prefix or marker).
    #[error("illegal object name `{0}`")]
    IllegalName(String),

    /// A store returned entries out of lexicographic order.
    #[error("store `{store}` listed `{name}` after `{previous}`")]
    UnsortedListing {
        store: String,
        previous: String,
        name: String,
    },

    /// An object disappeared between the decision and the action.
    #[error("object `{container}/{name}` vanished during reconciliation")]
    MissingObject { container: String, name: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TierError {
    pub fn unavailable(container: &str, name: &str) -> Self {
        Self::Unavailable {
            container: container.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether the caller may simply retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<std::io::Error> for TierError {
    fn from(err: std::io::Error) -> Self {
        TierError::Store(StoreError::Io(err))
    }
}

pub type TierResult<T> = Result<T, TierError>;
