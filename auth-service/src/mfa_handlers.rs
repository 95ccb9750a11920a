//! `POST /auth/mfa/setup` and `POST /auth/mfa/verify` (spec §6), thin shims
//! over `AuthCoordinator::begin_mfa_enrollment`/`confirm_mfa_enrollment`.
//!
//! Grounded on the reference workspace's `begin_mfa_enrollment`/`verify_mfa_enrollment`
//! handlers (kept the two-step shape, `MfaActivityEvent` emission), generalized
//! to a stateless setup step: nothing is written to `users` until verify succeeds,
//! so the client carries the pending secret between the two calls instead of a
//! `mfa_pending_secret` column.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use common_auth::AuthContext;
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::notifications::MfaActivityEvent;
use crate::AppState;

#[derive(Serialize)]
pub struct MfaEnrollmentResponse {
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(Deserialize)]
pub struct MfaEnrollRequest {
    pub secret: String,
    pub code: String,
}

#[derive(Serialize)]
pub struct MfaVerifyResponse {
    pub enabled: bool,
    pub recovery_codes: Vec<String>,
}

pub async fn begin_mfa_enrollment(
    State(state): State<AppState>,
    auth: AuthContext,
) -> ApiResult<Json<MfaEnrollmentResponse>> {
    let account_label = format!("{} ({})", auth.claims.subject, auth.claims.tenant_id);
    let (secret, otpauth_url) = state.auth.begin_mfa_enrollment(&state.config.mfa_issuer, &account_label);

    state.record_mfa_metric("enrollment_started");
    Ok(Json(MfaEnrollmentResponse { secret, otpauth_url }))
}

pub async fn verify_mfa_enrollment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<MfaEnrollRequest>,
) -> ApiResult<Json<MfaVerifyResponse>> {
    let trace_id = Uuid::new_v4();
    if payload.secret.trim().is_empty() {
        return Err(ApiError::bad_request("missing_secret", Some(trace_id)));
    }

    let result = state
        .auth
        .confirm_mfa_enrollment(auth.claims.subject, &payload.secret, &payload.code, trace_id)
        .await;

    let event = MfaActivityEvent {
        action: if result.is_ok() { "mfa.enrollment.completed" } else { "mfa.enrollment.verify_failed" },
        severity: if result.is_ok() { "info" } else { "warn" },
        tenant_id: auth.claims.tenant_id,
        user_id: Some(auth.claims.subject),
        trace_id,
        occurred_at: Utc::now(),
        ip: None,
        user_agent: None,
        device: None,
        role: None,
        detail: Some(json!({ "result": if result.is_ok() { "verified" } else { "rejected" } }).to_string()),
    };
    state.emit_mfa_activity(event, None).await;

    let recovery_codes = result?;
    state.record_mfa_metric("enrollment_completed");
    Ok(Json(MfaVerifyResponse { enabled: true, recovery_codes }))
}
