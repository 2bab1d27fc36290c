//! Errors returned by the buffer queue and its endpoints.
use nix::errno::Errno;
use thiserror::Error;

/// Error returned by every fallible operation on a surface, its queue or its
/// endpoints. Callers (and remote clients, through `Reply`) typically branch
/// on the kind, so it is kept small and copyable.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("invalid arguments")]
    InvalidArguments,
    #[error("operation not allowed in the current state")]
    InvalidOperating,
    #[error("no such entry, or entry in the wrong state")]
    NoEntry,
    #[error("no consumer is listening to the queue")]
    NoConsumer,
    #[error("no buffer available")]
    NoBuffer,
    #[error("limit exceeded")]
    OutOfRange,
    #[error("value has an unexpected type")]
    TypeError,
    #[error("operation not supported")]
    NotSupport,
    #[error("internal error")]
    Internal,
    #[error("system call failed: {0}")]
    ApiFailed(Errno),
}

impl From<Errno> for SurfaceError {
    fn from(errno: Errno) -> Self {
        Self::ApiFailed(errno)
    }
}

impl From<SurfaceError> for Errno {
    fn from(err: SurfaceError) -> Self {
        match err {
            SurfaceError::InvalidArguments => Errno::EINVAL,
            SurfaceError::InvalidOperating => Errno::EPERM,
            SurfaceError::NoEntry => Errno::ENOENT,
            SurfaceError::NoConsumer => Errno::EPIPE,
            SurfaceError::NoBuffer => Errno::EAGAIN,
            SurfaceError::OutOfRange => Errno::ERANGE,
            SurfaceError::TypeError => Errno::EINVAL,
            SurfaceError::NotSupport => Errno::EOPNOTSUPP,
            SurfaceError::Internal => Errno::EFAULT,
            SurfaceError::ApiFailed(e) => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, SurfaceError>;
