use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("missing tenant identifier")]    MissingTenant,
    #[error("mismatched tenant context")]    MismatchedTenant,
    #[error("unauthorized - missing required role")]    Forbidden,
    #[error("invalid authorization token")]  InvalidToken,
    #[error("internal security error")]      Internal,
    #[error("role assignment would close a cycle in the role graph")]    RoleCycle,
    #[error("role cannot be removed: still assigned to users or has child roles")]    RoleInUse,
    #[error("permission denied")]    PermissionDenied,
}

impl From<SecurityError> for (StatusCode, String) {
    fn from(e: SecurityError) -> Self {
        match e {
            SecurityError::MissingTenant => (StatusCode::BAD_REQUEST, e.to_string()),
            SecurityError::MismatchedTenant => (StatusCode::UNAUTHORIZED, e.to_string()),
            SecurityError::Forbidden => (StatusCode::FORBIDDEN, e.to_string()),
            SecurityError::InvalidToken => (StatusCode::UNAUTHORIZED, e.to_string()),
            SecurityError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            SecurityError::RoleCycle => (StatusCode::CONFLICT, e.to_string()),
            SecurityError::RoleInUse => (StatusCode::CONFLICT, e.to_string()),
            SecurityError::PermissionDenied => (StatusCode::FORBIDDEN, e.to_string()),
        }
    }
}
