use std::io;

use thiserror::Error;

// Standard errno constants compatible with MUSL
const ENOENT: i32 = 2;
const EIO: i32 = 5;
const EEXIST: i32 = 17;
const EINVAL: i32 = 22;
const ENOTEMPTY: i32 = 39;
const EBADF: i32 = 9;

/// Failure taxonomy for dispatcher operations. Everything the kernel can
/// observe maps onto an errno via [`FsError::errno`]; `Internal` covers
/// index invariant violations and is consistently reported as EIO.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,
    #[error("entry already exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad file handle")]
    BadHandle,
    #[error("backend I/O error: {0}")]
    Backend(#[from] io::Error),
    #[error("invariant violation: {0}")]
    Internal(String),
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => ENOENT,
            FsError::Exists => EEXIST,
            FsError::NotEmpty => ENOTEMPTY,
            FsError::InvalidArgument => EINVAL,
            FsError::BadHandle => EBADF,
            FsError::Backend(e) => e.raw_os_error().unwrap_or(EIO),
            FsError::Internal(_) => EIO,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        FsError::Internal(msg.into())
    }
}
