//! Error surface for the public entry points.
//!
//! The per-request completion state (`AioCb::error()` / `AioCb::result()`)
//! stays faithful to the C `aio_error`/`aio_return` convention: it is a raw
//! `errno` value, `0`, or `libc::EINPROGRESS`. This type is only used for the
//! synchronous return value of the submission and cancellation entry points.

use nix::errno::Errno;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AioError {
    /// The descriptor is not open (`EBADF`).
    #[error("bad file descriptor")]
    BadDescriptor,

    /// Worker creation or bookkeeping allocation failed (`EAGAIN`).
    #[error("resource temporarily unavailable")]
    ResourceExhausted,

    /// A cancel target disagreed with the given descriptor, or a sync
    /// opcode was neither `SYNC` nor `DSYNC` (`EINVAL`).
    #[error("invalid argument")]
    InvalidArgument,

    /// The underlying system call failed.
    #[error("I/O error: {0}")]
    Io(Errno),
}

impl AioError {
    /// The `errno` value a caller would see from the equivalent C entry
    /// point.
    pub fn errno(&self) -> Errno {
        match self {
            AioError::BadDescriptor => Errno::EBADF,
            AioError::ResourceExhausted => Errno::EAGAIN,
            AioError::InvalidArgument => Errno::EINVAL,
            AioError::Io(errno) => *errno,
        }
    }
}

impl From<Errno> for AioError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EBADF => AioError::BadDescriptor,
            Errno::EAGAIN => AioError::ResourceExhausted,
            Errno::EINVAL => AioError::InvalidArgument,
            other => AioError::Io(other),
        }
    }
}

pub type AioResult<T> = Result<T, AioError>;
