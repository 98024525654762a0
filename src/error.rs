//! Error taxonomy for the forest core.
//!
//! Every fallible operation in this crate returns [`ForestResult`]. Variants
//! map 1:1 onto the POSIX error codes a façade needs to hand back to the
//! kernel (see `to_errno`); low-level codec/backend failures are folded into
//! [`ForestError::Corruption`] or [`ForestError::Backend`] via `From`.

use thiserror::Error;

pub type ForestResult<T> = Result<T, ForestError>;

/// POSIX errno values the façade boundary understands (§7).
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EEXIST: i32 = 17;
    pub const EPERM: i32 = 1;
    pub const ENOTEMPTY: i32 = 39;
    pub const ENOATTR: i32 = 93;
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
}

#[derive(Debug, Error)]
pub enum ForestError {
    /// Missing directory entry, inode, or block (ENOENT).
    #[error("not found")]
    NotFound,

    /// Create/link target already exists (EEXIST).
    #[error("already exists")]
    Exists,

    /// Access check failed (EPERM).
    #[error("permission denied")]
    Permission,

    /// rmdir on a non-empty directory (ENOTEMPTY).
    #[error("directory not empty")]
    NotEmpty,

    /// xattr lookup/removal on an absent key (ENOATTR).
    #[error("attribute not found")]
    NoAttr,

    /// AEAD tag mismatch, CBOR decode failure, or an invariant violation on
    /// a loaded node (EIO). The state is left unchanged.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A refcount-0 block is still externally referenced; retry at the
    /// next flush.
    #[error("busy, retry at next flush")]
    Busy,

    /// Backend (I/O) failure, not a protocol-level corruption.
    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite-backend")]
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl ForestError {
    pub fn to_errno(&self) -> i32 {
        match self {
            ForestError::NotFound => errno::ENOENT,
            ForestError::Exists => errno::EEXIST,
            ForestError::Permission => errno::EPERM,
            ForestError::NotEmpty => errno::ENOTEMPTY,
            ForestError::NoAttr => errno::ENOATTR,
            ForestError::Corruption(_) => errno::EIO,
            ForestError::Busy => errno::EAGAIN,
            ForestError::Backend(_) => errno::EIO,
            ForestError::Io(_) => errno::EIO,
            #[cfg(feature = "sqlite-backend")]
            ForestError::Db(_) => errno::EIO,
        }
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        ForestError::Corruption(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        let cases: &[(ForestError, i32)] = &[
            (ForestError::NotFound, errno::ENOENT),
            (ForestError::Exists, errno::EEXIST),
            (ForestError::Permission, errno::EPERM),
            (ForestError::NotEmpty, errno::ENOTEMPTY),
            (ForestError::NoAttr, errno::ENOATTR),
            (ForestError::Corruption("x".into()), errno::EIO),
            (ForestError::Busy, errno::EAGAIN),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_errno(), *expected, "{err:?}");
        }
    }
}
