use thiserror::Error;

/// Every failure mode the storage engine can report.
///
/// Variants mirror the in-scope subset of return codes a physical volume
/// can produce; codes belonging to the virtual-volume/mount layer (handles,
/// mount points, logical-path routing) are not part of this crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid key")]
    InvalidKey,

    #[error("logical path cannot be mapped onto a physical one")]
    InvalidLogicalPath,

    #[error("given expiration timestamp is already in the past")]
    AlreadyExpired,

    #[error("key already exists")]
    AlreadyExists,

    #[error("element has children and cannot be erased without force")]
    HasChildren,

    #[error("no such path in the store")]
    NotFound,

    #[error("file is incompatible with the current policy")]
    IncompatibleFile,

    #[error("physical file is already opened")]
    AlreadyOpened,

    #[error("cannot open the specified file")]
    UnableToOpen(#[source] std::io::Error),

    #[error("the limit of concurrent operations over the physical volume was reached")]
    TooManyConcurrentOps,

    #[error("I/O error")]
    IoError(#[source] std::io::Error),

    #[error("data read from storage is invalid")]
    InvalidData,

    #[error("operation failed due to low memory")]
    InsufficientMemory,

    #[error("unknown error")]
    UnknownError,

    #[error("not yet implemented")]
    NotYetImplemented,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
