//! Typed error domain shared by every engine component.
//!
//! Protocol adapters map `ErrorCode` onto NFS status codes and SMB NTSTATUS
//! values, so the set of codes is closed and the mapping must stay stable.

use serde::{Deserialize, Serialize};

/// Stable error codes understood by all protocol adapters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    AccessDenied,
    AuthRequired,
    PermissionDenied,
    AlreadyExists,
    NotEmpty,
    IsDirectory,
    NotDirectory,
    InvalidArgument,
    IOError,
    NoSpace,
    QuotaExceeded,
    ReadOnly,
    NotSupported,
    InvalidHandle,
    StaleHandle,
    Locked,
    LockNotFound,
    PrivilegeRequired,
    NameTooLong,
    Deadlock,
    GracePeriod,
    LockLimitExceeded,
    LockConflict,
    ConnectionLimitReached,
}

/// Holder details attached to `LockConflict` errors so adapters can report
/// who owns the conflicting lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConflictInfo {
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
    pub owner_session_id: String,
}

#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
pub struct StoreError {
    pub code: ErrorCode,
    pub message: String,
    pub path: Option<String>,
    pub conflict: Option<LockConflictInfo>,
}

impl StoreError {
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
            conflict: None,
        }
    }

    pub fn with_path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn not_found<S: Into<String>>(path: S) -> Self {
        let path = path.into();
        Self::new(ErrorCode::NotFound, format!("no such entry: {}", path)).with_path(path)
    }

    pub fn access_denied<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::AccessDenied, message)
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn invalid_handle<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::InvalidHandle, message)
    }

    pub fn io_error<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::IOError, message)
    }

    /// The code list is closed, so a tripped cancellation token surfaces as
    /// an IO error with a well-known message.
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::IOError, "operation cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::IOError && self.message == "operation cancelled"
    }

    pub fn lock_conflict(info: LockConflictInfo) -> Self {
        let mut err = Self::new(
            ErrorCode::LockConflict,
            format!(
                "lock conflict with {} at [{}, len {}]",
                info.owner_session_id, info.offset, info.length
            ),
        );
        err.conflict = Some(info);
        err
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::IOError, err.to_string())
    }
}
