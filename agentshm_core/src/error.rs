//! Error types for the shared memory pool
//!
//! Every fallible operation returns [`ShmResult`]. Allocator entry points report
//! failure through `Err` and never abort the process.

use std::io;

/// Result alias used throughout AgentShm
pub type ShmResult<T> = Result<T, ShmError>;

/// Errors produced by the shared memory pool and its platform layer
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// Null handle, zero size, malformed name or pointer outside the pool
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The pool is at its maximum size and the request cannot be satisfied
    #[error("Out of shared memory: {requested} bytes requested, pool limited to {max_size} bytes")]
    OutOfMemory { requested: usize, max_size: usize },

    /// Operation not available on this platform or for this pool
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// An OS mapping or locking primitive failed
    #[error("{op} failed: {source}")]
    Fault {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A named object or directory could not be resolved
    #[error("Not found: {0}")]
    NotFound(String),

    /// Shared state failed a bounds or consistency check
    #[error("Corrupted pool: {0}")]
    Corrupted(String),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of [`ShmError`], kept on pool handles for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShmErrorKind {
    InvalidArgument,
    OutOfMemory,
    Unsupported,
    Fault,
    NotFound,
    Corrupted,
    Config,
}

impl ShmError {
    pub fn fault(op: &'static str, source: io::Error) -> Self {
        ShmError::Fault { op, source }
    }

    /// Fault from the calling thread's last OS error
    pub fn last_os_error(op: &'static str) -> Self {
        ShmError::Fault {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        ShmError::InvalidArgument(msg.into())
    }

    pub fn corrupted<S: Into<String>>(msg: S) -> Self {
        ShmError::Corrupted(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        ShmError::Config(msg.into())
    }

    pub fn kind(&self) -> ShmErrorKind {
        match self {
            ShmError::InvalidArgument(_) => ShmErrorKind::InvalidArgument,
            ShmError::OutOfMemory { .. } => ShmErrorKind::OutOfMemory,
            ShmError::Unsupported(_) => ShmErrorKind::Unsupported,
            ShmError::Fault { .. } => ShmErrorKind::Fault,
            ShmError::NotFound(_) => ShmErrorKind::NotFound,
            ShmError::Corrupted(_) => ShmErrorKind::Corrupted,
            ShmError::Config(_) => ShmErrorKind::Config,
        }
    }
}
