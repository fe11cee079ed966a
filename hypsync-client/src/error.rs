//! Error taxonomy shared across the crate.

/// Result type alias for synchronization operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the synchronization engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad arguments from the caller.
    #[error("bad arguments: {0}")]
    Usage(String),

    /// The cache file on disk belongs to a different group.
    #[error("cache group mismatch: configured for {expected}, file holds {found}")]
    GroupMismatch {
        /// Group this session is bound to.
        expected: String,
        /// Group found in the cache file.
        found: String,
    },

    /// The server answered with a non-2xx status.
    #[error("response was not ok: {status} {reason}")]
    NotOk {
        /// HTTP status code.
        status: u16,
        /// Canonical reason phrase.
        reason: String,
    },

    /// Connection-level failure that survived the retry budget.
    #[error("transport failure: {source}")]
    Transport {
        /// Underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Malformed frame, row, or cache file.
    #[error("malformed document: {0}")]
    Decode(String),

    /// Normal shutdown of the subscriber.
    #[error("shutdown requested")]
    Cancelled,

    /// Filesystem failure around the cache file or lock folder.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps a connection-level failure.
    pub fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport {
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
