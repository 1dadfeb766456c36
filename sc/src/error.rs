//! Caller-visible errors
//!
//! Only rejections surface to callers. Absent users and a disabled service
//! degrade to default results inside the core and never appear here.

use thiserror::Error;

use crate::domain::{Permission, Uid};

/// Errors returned to remote callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("{operation} requires any of: [{}], but none were granted", join_permissions(.permissions))]
    Denied {
        operation: String,
        permissions: Vec<Permission>,
    },

    #[error("Package {package} does not belong to uid {uid}")]
    PackageMismatch { package: String, uid: Uid },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result of a dispatched operation
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn denied(operation: &str, permissions: &[Permission]) -> Self {
        ServiceError::Denied {
            operation: operation.to_string(),
            permissions: permissions.to_vec(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::InvalidArgument(message.into())
    }

    /// Whether the error is a permission-class rejection
    pub fn is_security(&self) -> bool {
        matches!(self, ServiceError::Denied { .. } | ServiceError::PackageMismatch { .. })
    }
}

fn join_permissions(permissions: &[Permission]) -> String {
    permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", ")
}

/// Reject a blank required identifier
pub fn require_non_blank(operation: &str, field: &str, value: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::invalid(format!("{}: {} is required", operation, field)));
    }
    Ok(())
}
