use thiserror::Error;

use crate::oid::Oid;

/// Result alias used throughout the crate.
pub type DResult<T> = Result<T, Error>;

/// All error kinds the core can raise.
#[derive(Debug, Error)]
pub enum Error {
    /// The log is inconsistent: versions without a trailing record, a
    /// malformed or unknown reference scheme, or a deserialization failure
    /// mid-segment.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Our uncommitted modification targets an object whose latest
    /// committed serial exceeds our transaction's begin timestamp, and no
    /// resolver salvaged it.
    #[error("write conflict on oid {0}")]
    WriteConflict(Oid),

    /// Incoming committed state contradicts our working copy and no
    /// resolver is provided, or the resolver itself failed.
    #[error("read conflict on {0} object(s)")]
    ReadConflict(usize),

    /// Operation sees a persistent object bound to a different database.
    #[error("object belongs to a different database jar")]
    InvalidObjectReference,

    /// At vote time, some persistent-local object is still unconnected.
    #[error("object not connected to the persistent graph (oid={0:?})")]
    ObjectGraph(Option<Oid>),

    /// Non-persistent object passed where persistent is required; raw
    /// stream source passed where a stream wrapper is required; or an
    /// attribute access against a broken placeholder.
    #[error("type error: {0}")]
    TypeError(String),

    /// Re-adding an object, re-setting the root, closing an already-closed
    /// stream, mutating in shared mode, and similar misuse.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// I/O failure. `retryable` is set for commit-lock contention at
    /// `tpc_begin`, the one case callers are expected to retry rather than
    /// treat as fatal.
    #[error("io error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        retryable: bool,
    },

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl Error {
    pub fn retryable_io(source: std::io::Error) -> Self {
        Error::Io { source, retryable: true }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io { retryable: true, .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io { source, retryable: false }
    }
}
