use crate::storage::StorageError;
use common::ManifestError;
use thiserror::Error;

/// Errors raised by the node core. `Auth` and `Registration` (without the
/// development override) terminate the process, everything else is retried
/// or degraded per its policy.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("credential exchange rejected by control plane: {0}")]
    Auth(String),

    #[error("control channel transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("registration rejected by control plane: {0}")]
    Registration(String),

    #[error("keepalive failed: {0}")]
    Keepalive(String),

    #[error("sync finished with {failed} file(s) still missing")]
    Sync { failed: usize },

    #[error("origin returned status {status} for {url}")]
    OriginStatus {
        status: u16,
        url: String,
        /// Hops followed before the failing response, carried so the
        /// caller can report the whole chain.
        redirects: Vec<String>,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl NodeError {
    /// Whether this error must terminate the process once it reaches the
    /// top of the call stack.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Auth(_) | NodeError::Registration(_))
    }
}
