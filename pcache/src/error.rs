use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("out of memory")]
    NoMemory,

    #[error("range [{offset}, +{length}) holds dirty data that is not written back")]
    DirtyData { offset: u64, length: u64 },

    #[error("partial write: {written} of {expected} bytes")]
    PartialWrite { expected: u64, written: u64 },

    #[error("Invalid metadata: {0}")]
    Metadata(String),

    #[error(transparent)]
    Codec(#[from] bincode::Error),

    #[error("cache entry is inconsistent: {0}")]
    Inconsistent(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("write-back failed: {0}")]
    WriteBack(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Negative errno a host would hand back to its own caller.
    pub fn errno(&self) -> i32 {
        match self {
            CacheError::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            CacheError::NoMemory => -libc::ENOMEM,
            CacheError::DirtyData { .. } => -libc::EPERM,
            CacheError::PartialWrite { .. } => -libc::EIO,
            CacheError::Metadata(_) | CacheError::Codec(_) => -libc::EINVAL,
            CacheError::Inconsistent(_) => -libc::EIO,
            CacheError::InvalidConfig(_) => -libc::EINVAL,
            CacheError::WriteBack(_) => -libc::EIO,
        }
    }
}
