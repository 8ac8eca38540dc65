//! Core error kinds (§7).
//!
//! Every fallible core operation returns [`CoreError`]. The variants
//! mirror spec.md §7's error-kind table directly so the propagation
//! policy there (which kinds close the connection vs. which are
//! reported on the affected object) can be implemented as a single
//! match over this enum.

use patchbay_proto::{PodError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("out of memory")]
    NoMemory,

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("timeout")]
    Timeout,

    #[error("peer gone")]
    PeerGone,

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("no common format")]
    NoFormat,

    #[error("invalid param: {0}")]
    InvalidParam(String),

    #[error("xrun on node {node_id} (cycle {cycle})")]
    XRun { node_id: u32, cycle: u64 },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Whether this error closes the owning connection and destroys all
    /// of its resources, per spec.md §7's propagation policy. Everything
    /// else is reported on the affected object and leaves the
    /// connection open.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, CoreError::Malformed(_) | CoreError::PeerGone | CoreError::IoError(_))
    }
}

impl From<PodError> for CoreError {
    fn from(e: PodError) -> Self {
        match e {
            PodError::FdIndexOutOfRange { .. } => CoreError::Malformed(e.to_string()),
            other => CoreError::Malformed(other.to_string()),
        }
    }
}

impl From<crate::shm::ShmError> for CoreError {
    fn from(e: crate::shm::ShmError) -> Self {
        use crate::shm::ShmError;
        match e {
            ShmError::Oom => CoreError::NoMemory,
            ShmError::FdLimit => CoreError::NoSpace("fd limit reached".into()),
            ShmError::SealRejected(_) => CoreError::PermissionDenied("kernel rejected seal".into()),
            ShmError::BlockClosed => CoreError::NotFound("memory block closed".into()),
            ShmError::Unsealed => CoreError::PermissionDenied("memory block is not sealed".into()),
            ShmError::Mmap(errno) => CoreError::IoError(std::io::Error::from(errno)),
            ShmError::Io(io) => CoreError::IoError(io),
        }
    }
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PeerGone => CoreError::PeerGone,
            TransportError::MessageTooLarge { .. } => CoreError::Malformed(e.to_string()),
            TransportError::FdExhausted => CoreError::NoSpace(e.to_string()),
            TransportError::Pod(p) => CoreError::from(p),
            TransportError::Io(io) => CoreError::IoError(io),
            TransportError::Nix(errno) => CoreError::IoError(std::io::Error::from(errno)),
        }
    }
}
