use vgpu_protocol::{DecodeError, EncodeError};

pub type Result<T> = std::result::Result<T, VgpuError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VgpuError {
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("unknown {kind} handle {id}")]
    NotFound { kind: &'static str, id: u32 },
    #[error("no resources: {0}")]
    NoResources(String),
    #[error("out of memory")]
    NoMemory,
    #[error("not ready: {0}")]
    NotReady(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Reserved; no operation currently enforces a deadline.
    #[error("operation timed out")]
    Timeout,
    #[error("malformed command stream: {0}")]
    Protocol(#[from] DecodeError),
    #[error("command encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("device rejected request: {0}")]
    Device(String),
}

impl VgpuError {
    pub(crate) fn bad_argument(msg: impl Into<String>) -> Self {
        Self::BadArgument(msg.into())
    }

    pub(crate) fn no_resources(msg: impl Into<String>) -> Self {
        Self::NoResources(msg.into())
    }
}
