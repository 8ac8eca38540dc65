//! Error kinds shared by the codec and transport layers.

use thiserror::Error;

/// Errors raised while building or parsing a typed payload (POD).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PodError {
    #[error("malformed pod: {0}")]
    MalformedPod(&'static str),

    #[error("unexpected pod type: expected {expected}, got {actual}")]
    UnexpectedType { expected: &'static str, actual: u32 },

    #[error("fd index {index} out of range (attached fd count {count})")]
    FdIndexOutOfRange { index: u32, count: usize },

    #[error("buffer exhausted: need at least {required} bytes")]
    BufferExhausted { required: usize },

    #[error("frame stack underflow")]
    FrameUnderflow,
}

/// Errors raised by the framed transport connection (C3).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer gone")]
    PeerGone,

    #[error("message too large: {size} exceeds cap {cap}")]
    MessageTooLarge { size: usize, cap: usize },

    #[error("outbound ancillary fd queue exhausted")]
    FdExhausted,

    #[error("pod error: {0}")]
    Pod(#[from] PodError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}
