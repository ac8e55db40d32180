use libc::c_int;
use thiserror::Error;

use crate::store::EntryId;

/// Errors returned by the metadata store, the content cache and the remote transport.
///
/// The filesystem adapter turns these into errno values with [`FsError::errno`].
#[derive(Debug, Error)]
pub enum FsError {
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("an entry named {name:?} already exists under {parent}")]
    Conflict { parent: EntryId, name: String },
    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(EntryId),
    #[error("entry {0} is not a directory")]
    NotADirectory(EntryId),
    #[error("entry {0} is a directory")]
    IsADirectory(EntryId),
    #[error("cannot move {id} under {new_parent}")]
    InvalidMove { id: EntryId, new_parent: EntryId },
    #[error("release of entry {0} without a matching reference")]
    RefcountUnderflow(EntryId),
    #[error("the root entry cannot be removed or moved")]
    RootImmutable,
    #[error("parent chain of entry {0} loops back on itself")]
    CorruptTree(EntryId),
    #[error("unknown cache handle {0}")]
    BadHandle(u64),
    #[error("handle {0} was not opened for this access")]
    AccessDenied(u64),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database schema version {found} does not match expected version {expected}")]
    SchemaVersion { found: i64, expected: i64 },
    #[error("credential expired")]
    AuthExpired,
    #[error("credential rejected: {0}")]
    AuthInvalid(String),
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("remote rejected the request: {0}")]
    RemoteRejected(String),
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        FsError::NotFound(what.to_string())
    }

    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Conflict { .. } => libc::EEXIST,
            FsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::InvalidMove { .. } => libc::EINVAL,
            FsError::RootImmutable => libc::EBUSY,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::AccessDenied(_) => libc::EACCES,
            FsError::AuthExpired | FsError::AuthInvalid(_) => libc::EACCES,
            FsError::RemoteUnavailable(_) | FsError::RemoteRejected(_) => libc::EREMOTEIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::RefcountUnderflow(_)
            | FsError::CorruptTree(_)
            | FsError::Storage(_)
            | FsError::SchemaVersion { .. } => libc::EIO,
        }
    }

    /// Whether retrying the same remote call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::RemoteUnavailable(_) | FsError::AuthExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(libc::ENOENT, FsError::not_found("x").errno());
        assert_eq!(
            libc::ENOTEMPTY,
            FsError::DirectoryNotEmpty(EntryId::ROOT).errno()
        );
        assert_eq!(
            libc::EEXIST,
            FsError::Conflict {
                parent: EntryId::ROOT,
                name: "a".into()
            }
            .errno()
        );
        let io = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(libc::ENOSPC, FsError::from(io).errno());
        assert!(FsError::RemoteUnavailable("503".into()).is_transient());
        assert!(!FsError::AuthInvalid("bad".into()).is_transient());
    }
}
