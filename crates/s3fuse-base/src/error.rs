use thiserror::Error;

/// Errors surfaced by the filesystem layers.
///
/// Every variant has a stable errno mapping; worker tasks cross the pool
/// boundary as a negative errno and are re-hydrated with [`Error::from_errno`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("object not found")]
    NotFound,

    #[error("object already exists")]
    AlreadyExists,

    #[error("no such attribute")]
    NoData,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource busy")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request failed with status {status}")]
    RequestFailed {
        /// HTTP response code, or 0 when the transport failed outright.
        status: u16,
    },

    #[error("request timed out")]
    Timeout,

    #[error("access denied")]
    Denied,

    #[error("operation interrupted")]
    Interrupted,

    #[error("no such device")]
    NoDevice,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("body digest mismatch")]
    DigestMismatch,
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps this error to a positive POSIX errno.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            Error::NotFound => ENOENT,
            Error::AlreadyExists => EEXIST,
            Error::NoData => ENODATA,
            Error::InvalidArgument(_) => EINVAL,
            Error::Busy => EBUSY,
            Error::Io(e) => e.raw_os_error().unwrap_or(EIO),
            Error::RequestFailed { .. } => EIO,
            Error::Timeout => ETIMEDOUT,
            Error::Denied => EACCES,
            Error::Interrupted => EINTR,
            Error::NoDevice => ENODEV,
            Error::NotEmpty => ENOTEMPTY,
            Error::NotDirectory => ENOTDIR,
            Error::IsDirectory => EISDIR,
            Error::DigestMismatch => EIO,
        }
    }

    /// Task status for the worker-pool boundary: 0 on success, `-errno` on error.
    pub fn to_status(&self) -> i32 {
        -self.to_errno()
    }

    /// Reconstructs an error from a positive errno.
    ///
    /// Lossy by design: detail strings do not survive the pool boundary, only
    /// the errno does, matching what the FUSE binding ultimately returns.
    pub fn from_errno(errno: i32) -> Self {
        use libc::*;
        match errno {
            ENOENT => Error::NotFound,
            EEXIST => Error::AlreadyExists,
            ENODATA => Error::NoData,
            EINVAL => Error::InvalidArgument(String::new()),
            EBUSY => Error::Busy,
            ETIMEDOUT => Error::Timeout,
            EACCES => Error::Denied,
            EINTR => Error::Interrupted,
            ENODEV => Error::NoDevice,
            ENOTEMPTY => Error::NotEmpty,
            ENOTDIR => Error::NotDirectory,
            EISDIR => Error::IsDirectory,
            _ => Error::RequestFailed { status: 0 },
        }
    }
}

/// Collapses a fallible task body into a pool status code.
pub fn status_of(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.to_status(),
    }
}

/// Re-hydrates a pool status code, 0 becoming `Ok(())`.
pub fn result_of(status: i32) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(Error::from_errno(-status))
    }
}
