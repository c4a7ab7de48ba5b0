#[macro_use]
extern crate log;

mod config;
mod types;
mod units;
mod volume_id;
mod volume_lock;

pub use config::*;
pub use types::*;
pub use units::*;
pub use volume_id::*;
pub use volume_lock::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostPathError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation already in progress: {0}")]
    AlreadyInProgress(String),
    #[error("function is not implemented: {0}")]
    Unimplemented(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Status codes a CSI front end reports back to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsiCode {
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    InvalidArgument,
    Aborted,
    Unimplemented,
    Internal,
}

impl HostPathError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HostPathError::NotFound(_))
    }

    /// Lock contention and transient I/O are worth retrying, everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HostPathError::AlreadyInProgress(_) | HostPathError::IoError(_)
        )
    }

    pub fn csi_code(&self) -> CsiCode {
        match self {
            HostPathError::NotFound(_) => CsiCode::NotFound,
            HostPathError::AlreadyExists(_) => CsiCode::AlreadyExists,
            HostPathError::ResourceExhausted(_) => CsiCode::ResourceExhausted,
            HostPathError::InvalidArgument(_) => CsiCode::InvalidArgument,
            HostPathError::AlreadyInProgress(_) => CsiCode::Aborted,
            HostPathError::Unimplemented(_) => CsiCode::Unimplemented,
            HostPathError::IoError(_) => CsiCode::Internal,
            HostPathError::InvalidData(_) => CsiCode::Internal,
            HostPathError::Internal(_) => CsiCode::Internal,
        }
    }
}

pub type HostPathResult<T> = std::result::Result<T, HostPathError>;

impl From<std::io::Error> for HostPathError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => HostPathError::NotFound(err.to_string()),
            _ => HostPathError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for HostPathError {
    fn from(err: serde_json::Error) -> Self {
        HostPathError::InvalidData(err.to_string())
    }
}

pub const DRIVER_NAME: &str = "xfsquota.hostpath.csi";
pub const DEFAULT_QUOTA_ROOT: &str = "/xfs";
pub const DEFAULT_QUOTA_DIR_PREFIX: &str = "k8squota";
pub const DEFAULT_PROJECT_ID_START: u32 = 1000000;
pub const DEFAULT_PROJECT_ID_COUNT: u32 = 5000;
pub const DISK_DISABLE_XATTR_KEY: &str = "user.storage.hostpathpv.xfsquota/disable";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: HostPathError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());

        let err: HostPathError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, HostPathError::IoError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_csi_code_mapping() {
        assert_eq!(
            HostPathError::AlreadyInProgress("vol".to_string()).csi_code(),
            CsiCode::Aborted
        );
        assert_eq!(
            HostPathError::ResourceExhausted("disk".to_string()).csi_code(),
            CsiCode::ResourceExhausted
        );
        assert_eq!(
            HostPathError::IoError("statfs".to_string()).csi_code(),
            CsiCode::Internal
        );
        assert!(!HostPathError::InvalidArgument("x".to_string()).is_retryable());
    }
}
