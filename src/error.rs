//! Typed errors for component boundaries.
//!
//! [`VikingError`] carries the failure taxonomy the filesystem,
//! transaction, and queue layers share. [`ErrorKind`] is the coarse
//! classification callers branch on without matching message text.

use thiserror::Error;

use crate::lock::LockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    LockConflict,
    Corruption,
    Backend,
    Timeout,
    InvalidArgument,
}

#[derive(Error, Debug)]
pub enum VikingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Path {path} is locked by transaction {owner}")]
    LockConflict { path: String, owner: String },

    #[error("Lock marker at {path} holds '{found}', expected '{expected}'")]
    Corruption {
        path: String,
        expected: String,
        found: String,
    },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VikingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VikingError::NotFound(_) => ErrorKind::NotFound,
            VikingError::LockConflict { .. } => ErrorKind::LockConflict,
            VikingError::Corruption { .. } => ErrorKind::Corruption,
            VikingError::Timeout(_) => ErrorKind::Timeout,
            VikingError::InvalidArgument(_) | VikingError::InvalidUri(_) => {
                ErrorKind::InvalidArgument
            }
            VikingError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            VikingError::Json(_) => ErrorKind::InvalidArgument,
            VikingError::Backend(_) | VikingError::Io(_) | VikingError::Sqlx(_) => {
                ErrorKind::Backend
            }
            VikingError::Other(e) => match e.downcast_ref::<VikingError>() {
                Some(inner) => inner.kind(),
                None => ErrorKind::Backend,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<LockError> for VikingError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Conflict { path, owner } => VikingError::LockConflict { path, owner },
            LockError::Corruption {
                path,
                expected,
                found,
            } => VikingError::Corruption {
                path,
                expected,
                found,
            },
            LockError::NotFound(path) => VikingError::NotFound(path),
            LockError::Backend(msg) => VikingError::Backend(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, VikingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(VikingError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            VikingError::InvalidUri("x".into()).kind(),
            ErrorKind::InvalidArgument
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(VikingError::from(io).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_kind_survives_anyhow_wrapping() {
        let inner = anyhow::Error::new(VikingError::Timeout("txn".into()));
        assert_eq!(VikingError::Other(inner).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_lock_error_conversion() {
        let e: VikingError = LockError::Conflict {
            path: "/local/a".into(),
            owner: "t1".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::LockConflict);
        assert!(e.to_string().contains("t1"));
    }
}
