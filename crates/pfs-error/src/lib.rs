#![forbid(unsafe_code)]
//! Error types for PicoFS.
//!
//! Two-layer model: `ParseError` (in `pfs-types`) covers on-disk format
//! violations detected while decoding bytes; `PfsError` (this crate) is the
//! runtime taxonomy returned by every public operation. This crate depends
//! on no other PicoFS crate so the conversion from `ParseError` lives at the
//! boundaries that see both types.
//!
//! Taxonomy, matching how failures are treated:
//!
//! | Variant | Treatment |
//! |---|---|
//! | `Corruption` | logged with context, operation aborted, never repaired |
//! | `NoSpace` | returned to caller, no state mutated |
//! | `Io` | propagated; multi-block scans may skip and continue degraded |
//! | `Conflict` | internal, bounded retry; escalates to `Corruption` past the ceiling |
//! | `Format` | mount-time fatal: bad magic/version/geometry |

use thiserror::Error;

/// Unified runtime error for all PicoFS operations.
#[derive(Debug, Error)]
pub enum PfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata is internally inconsistent: double free, reserved
    /// bit mutation, malformed directory record, pointer out of range.
    /// Aborts the offending operation; never silently repaired.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u16, detail: String },

    /// The image is not a PicoFS volume or its geometry is unusable
    /// (wrong magic, unsupported version, block count out of range).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// No free blocks or inodes available. Nothing was mutated.
    #[error("no space left on device")]
    NoSpace,

    /// An indirection chain changed between read and splice. Internal;
    /// retried up to a fixed ceiling before escalating.
    #[error("concurrent modification on inode {ino} around block {block}")]
    Conflict { ino: u16, block: u32 },

    /// Named entry not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Directory entry with the same name already exists.
    #[error("entry exists")]
    Exists,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Directory operation attempted on a non-directory capable inode.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir or rename-over target is a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Name exceeds the 252-byte limit.
    #[error("name too long")]
    NameTooLong,

    /// Link count would exceed the 32000 ceiling.
    #[error("too many links")]
    TooManyLinks,

    /// The operation is not permitted on this object (hard link to a
    /// directory).
    #[error("operation not permitted")]
    NotPermitted,

    /// Filesystem is mounted read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl PfsError {
    /// Convert into a POSIX errno.
    ///
    /// The match is exhaustive so a new variant is a compile error until its
    /// errno is assigned. `Conflict` maps to `EAGAIN`: callers that see it
    /// (only past the retry ceiling) may retry at a higher layer.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::Conflict { .. } => libc::EAGAIN,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::TooManyLinks => libc::EMLINK,
            Self::NotPermitted => libc::EPERM,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether this failure signals structural corruption (as opposed to a
    /// resource or environment condition).
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(PfsError, libc::c_int)> = vec![
            (PfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                PfsError::Corruption {
                    block: 1,
                    detail: "x".to_owned(),
                },
                libc::EIO,
            ),
            (PfsError::Format("bad".to_owned()), libc::EINVAL),
            (PfsError::NoSpace, libc::ENOSPC),
            (PfsError::Conflict { ino: 4, block: 9 }, libc::EAGAIN),
            (PfsError::NotFound("f".to_owned()), libc::ENOENT),
            (PfsError::Exists, libc::EEXIST),
            (PfsError::NotDirectory, libc::ENOTDIR),
            (PfsError::IsDirectory, libc::EISDIR),
            (PfsError::NotEmpty, libc::ENOTEMPTY),
            (PfsError::NameTooLong, libc::ENAMETOOLONG),
            (PfsError::TooManyLinks, libc::EMLINK),
            (PfsError::NotPermitted, libc::EPERM),
            (PfsError::ReadOnly, libc::EROFS),
        ];
        for (err, errno) in cases {
            assert_eq!(err.to_errno(), errno, "wrong errno for {err}");
        }
    }

    #[test]
    fn corruption_predicate() {
        assert!(
            PfsError::Corruption {
                block: 0,
                detail: "double free".to_owned()
            }
            .is_corruption()
        );
        assert!(!PfsError::NoSpace.is_corruption());
    }

    #[test]
    fn io_error_preserves_raw_errno() {
        let err = PfsError::Io(std::io::Error::from_raw_os_error(libc::ENXIO));
        assert_eq!(err.to_errno(), libc::ENXIO);
    }
}
