//! Errors raised by shared quota and cache storage backends.

/// Failure of a quota store or response cache backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend answered but reported an error.
    #[error("store backend error: {0}")]
    Backend(String),

    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be interpreted.
    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// A value could not be encoded for storage.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns `true` when retrying against the same backend may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
