//! Use-case coordinators (spec §4.9/§4.10). Each coordinator method owns one
//! `UnitOfWork` scope end to end and returns `common_http_errors::ApiError`
//! directly, so axum handlers stay a thin `?`-propagating shim over them —
//! the "thin glue" the reference workspace's `user_handlers.rs` was refactored
//! out of.

pub mod admin;
pub mod auth;

use common_http_errors::ApiError;
use uuid::Uuid;

use crate::repository::RepoError;

fn map_repo_error(err: RepoError, trace_id: Option<Uuid>) -> ApiError {
    match err {
        RepoError::NotFound => ApiError::NotFound { code: "not_found", trace_id },
        RepoError::DuplicateKey(_) => ApiError::Conflict { code: "duplicate_key", trace_id },
        RepoError::Other(err) => ApiError::internal(err, trace_id),
    }
}

fn map_anyhow(err: anyhow::Error, trace_id: Option<Uuid>) -> ApiError {
    ApiError::internal(err, trace_id)
}
