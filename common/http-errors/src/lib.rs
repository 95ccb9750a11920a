use axum::{http::{StatusCode, HeaderValue}, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub missing_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub mfa_required: Option<bool>,
}

#[derive(Debug)]
pub enum ApiError {
    ForbiddenMissingRole { role: &'static str, trace_id: Option<Uuid> },
    Forbidden { trace_id: Option<Uuid> },
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    /// Invalid, expired, or revoked credentials/tokens — collapses "no such
    /// user" and "wrong password" into one code so neither leaks to the caller.
    Unauthorized { code: &'static str, trace_id: Option<Uuid> },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    Internal { trace_id: Option<Uuid>, message: Option<String> },
    /// Account locked after repeated authentication failures.
    Locked { retry_after: i64, trace_id: Option<Uuid> },
    /// Credentials accepted but an MFA challenge must still be satisfied.
    MfaRequired { trace_id: Option<Uuid> },
    /// A uniqueness constraint (email, role name, ...) would be violated.
    Conflict { code: &'static str, trace_id: Option<Uuid> },
    /// Caller exceeded a rate limit; `retry_after` is advisory seconds.
    TooManyRequests { retry_after: i64, trace_id: Option<Uuid> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self { Self::Internal { trace_id, message: Some(e.to_string()) } }
    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::BadRequest { code, trace_id, message: None } }
    pub fn conflict(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::Conflict { code, trace_id } }
}

fn body(code: &str, missing_role: Option<String>, trace_id: Option<Uuid>, message: Option<String>, mfa_required: Option<bool>) -> ErrorBody {
    ErrorBody { code: code.into(), missing_role, trace_id, message, mfa_required }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, resp_body, error_code, retry_after): (StatusCode, ErrorBody, &str, Option<i64>) = match self {
            ApiError::ForbiddenMissingRole { role, trace_id } => (
                StatusCode::FORBIDDEN,
                body("missing_role", Some(role.into()), trace_id, None, None),
                "missing_role", None
            ),
            ApiError::Forbidden { trace_id } => (
                StatusCode::FORBIDDEN,
                body("forbidden", None, trace_id, None, None),
                "forbidden", None
            ),
            ApiError::BadRequest { code, trace_id, message } => (
                StatusCode::BAD_REQUEST,
                body(code, None, trace_id, message, None),
                code, None
            ),
            ApiError::Unauthorized { code, trace_id } => (
                StatusCode::UNAUTHORIZED,
                body(code, None, trace_id, None, None),
                code, None
            ),
            ApiError::NotFound { code, trace_id } => (
                StatusCode::NOT_FOUND,
                body(code, None, trace_id, None, None),
                code, None
            ),
            ApiError::Internal { trace_id, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                body("internal_error", None, trace_id, message, None),
                "internal_error", None
            ),
            ApiError::Locked { retry_after, trace_id } => (
                StatusCode::LOCKED,
                body("account_locked", None, trace_id, None, None),
                "account_locked", Some(retry_after)
            ),
            ApiError::MfaRequired { trace_id } => (
                StatusCode::ACCEPTED,
                body("mfa_required", None, trace_id, None, Some(true)),
                "mfa_required", None
            ),
            ApiError::Conflict { code, trace_id } => (
                StatusCode::CONFLICT,
                body(code, None, trace_id, None, None),
                code, None
            ),
            ApiError::TooManyRequests { retry_after, trace_id } => (
                StatusCode::TOO_MANY_REQUESTS,
                body("too_many_requests", None, trace_id, None, None),
                "too_many_requests", Some(retry_after)
            ),
        };
        let mut resp = (status, Json(resp_body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        if let Some(seconds) = retry_after {
            if let Ok(val) = HeaderValue::from_str(&seconds.to_string()) {
                resp.headers_mut().insert("Retry-After", val);
            }
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
