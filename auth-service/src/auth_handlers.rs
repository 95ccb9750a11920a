//! `POST /auth/login`, `/auth/refresh`, `/auth/logout` (spec §6), thin shims
//! over `AuthCoordinator`.
//!
//! Grounded on the reference workspace's `login_user`/`refresh_session`/`logout_user`
//! (kept: refresh-token-as-HttpOnly-cookie transport, the cookie helpers
//! themselves) generalized to call the coordinator instead of inlining the
//! state machine against a bare `PgPool`.

use axum::extract::State;
use axum::http::{
    header::{COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue, StatusCode,
};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, SecondsFormat};
use common_auth::AuthContext;
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::coordinator::auth::LoginRequest as CoordinatorLoginRequest;
use crate::tokens::IssuedTokens;
use crate::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub mfa_code: Option<String>,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
    pub token_type: &'static str,
    pub access_token_expires_at: String,
    pub refresh_token_expires_at: String,
    pub user_id: Uuid,
}

fn token_response(issued: IssuedTokens, user_id: Uuid, config: &AuthConfig) -> Response {
    let IssuedTokens {
        access_token,
        refresh_token,
        access_expires_at,
        refresh_expires_at,
        access_expires_in,
        refresh_expires_in,
        token_type,
    } = issued;

    let body = LoginResponse {
        access_token,
        expires_in: access_expires_in,
        refresh_expires_in,
        token_type,
        access_token_expires_at: access_expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        refresh_token_expires_at: refresh_expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        user_id,
    };

    let cookie = build_refresh_cookie(config, &refresh_token, refresh_expires_in);
    let mut reply = Json(body).into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        reply.headers_mut().append(SET_COOKIE, value);
    }
    reply
}

pub async fn login_user(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> ApiResult<Response> {
    state.record_login_metric("attempt");
    let trace_id = Uuid::new_v4();

    let outcome = state
        .auth
        .login(CoordinatorLoginRequest {
            tenant_id: payload.tenant_id,
            email: payload.email,
            password: payload.password,
            mfa_code: payload.mfa_code,
            trace_id,
        })
        .await;

    match &outcome {
        Ok(_) => state.record_login_metric("success"),
        Err(_) => state.record_login_metric("failure"),
    }

    let outcome = outcome?;
    state.record_token_metric("issued");
    Ok(token_response(outcome.tokens, outcome.user_id, &state.config))
}

pub async fn refresh_session(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    let trace_id = Uuid::new_v4();
    let Some(refresh_token) = extract_refresh_cookie(&headers, &state.config) else {
        return Err(ApiError::Unauthorized { code: "missing_refresh_token", trace_id: Some(trace_id) });
    };

    let outcome = state.auth.refresh(&refresh_token, trace_id).await?;
    state.record_token_metric("refreshed");
    Ok(token_response(outcome.tokens, outcome.user_id, &state.config))
}

pub async fn logout_user(State(state): State<AppState>, auth: AuthContext, headers: HeaderMap) -> impl IntoResponse {
    let trace_id = Uuid::new_v4();
    let refresh_token = extract_refresh_cookie(&headers, &state.config);
    let jti = auth.claims.raw.get("jti").and_then(|v| v.as_str()).unwrap_or_default();

    let _ = state
        .auth
        .logout(jti, auth.claims.subject, refresh_token.as_deref(), trace_id)
        .await;
    state.record_token_metric("revoked");

    let clear_cookie = clear_refresh_cookie(&state.config);
    let mut response = Response::new(axum::body::Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    if let Ok(value) = HeaderValue::from_str(&clear_cookie) {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}

fn build_refresh_cookie(config: &AuthConfig, token: &str, max_age_seconds: i64) -> String {
    let mut parts = Vec::new();
    parts.push(format!("{}={}", config.refresh_cookie_name, token));
    parts.push("Path=/".to_string());
    parts.push("HttpOnly".to_string());

    let max_age = max_age_seconds.max(0);
    parts.push(format!("Max-Age={}", max_age));
    if max_age > 0 {
        let expires = (chrono::Utc::now() + Duration::seconds(max_age)).to_rfc2822();
        parts.push(format!("Expires={}", expires));
    }

    if let Some(domain) = &config.refresh_cookie_domain {
        if !domain.is_empty() {
            parts.push(format!("Domain={}", domain));
        }
    }

    parts.push(format!("SameSite={}", config.refresh_cookie_same_site.as_str()));
    if config.refresh_cookie_secure {
        parts.push("Secure".to_string());
    }
    parts.join("; ")
}

fn clear_refresh_cookie(config: &AuthConfig) -> String {
    let mut parts = Vec::new();
    parts.push(format!("{}=", config.refresh_cookie_name));
    parts.push("Path=/".to_string());
    parts.push("Max-Age=0".to_string());
    parts.push("Expires=Thu, 01 Jan 1970 00:00:00 GMT".to_string());
    parts.push("HttpOnly".to_string());
    parts.push(format!("SameSite={}", config.refresh_cookie_same_site.as_str()));
    if let Some(domain) = &config.refresh_cookie_domain {
        if !domain.is_empty() {
            parts.push(format!("Domain={}", domain));
        }
    }
    if config.refresh_cookie_secure {
        parts.push("Secure".to_string());
    }
    parts.join("; ")
}

fn extract_refresh_cookie(headers: &HeaderMap, config: &AuthConfig) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    let prefix = format!("{}=", config.refresh_cookie_name);
    raw.split(';')
        .map(|segment| segment.trim())
        .find_map(|segment| segment.strip_prefix(&prefix))
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CookieSameSite;

    fn test_config() -> AuthConfig {
        AuthConfig {
            mfa_issuer: "auth-service".to_string(),
            mfa_activity_topic: "security.mfa.activity".to_string(),
            suspicious_webhook_url: None,
            suspicious_webhook_bearer: None,
            refresh_cookie_name: "refresh_token".to_string(),
            refresh_cookie_domain: Some("example.com".to_string()),
            refresh_cookie_secure: true,
            refresh_cookie_same_site: CookieSameSite::Strict,
            pepper: "test-pepper".to_string(),
            password_hash_cost: crate::password::HashCost { m_cost: 19_456, t_cost: 2, p_cost: 1 },
            login_attempt_limit: 5,
            login_lockout_seconds: 900,
            mfa_window_steps: 1,
            mfa_attempt_limit: 5,
            key_rotation_interval_days: 90,
            key_grace_days: 7,
            cache_url: None,
        }
    }

    #[test]
    fn build_refresh_cookie_sets_expected_attributes() {
        let config = test_config();
        let cookie = build_refresh_cookie(&config, "token123", 3600);

        assert!(cookie.contains("refresh_token=token123"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.contains("Expires="));
        assert!(cookie.contains("Domain=example.com"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Secure"));
    }

    #[test]
    fn build_refresh_cookie_handles_negative_max_age() {
        let mut config = test_config();
        config.refresh_cookie_domain = None;
        config.refresh_cookie_secure = false;

        let cookie = build_refresh_cookie(&config, "short", -10);
        assert!(cookie.contains("Max-Age=0"));
        assert!(!cookie.contains("Expires="));
        assert!(!cookie.contains("Domain="));
        assert!(!cookie.contains("Secure"));
    }

    #[test]
    fn clear_refresh_cookie_produces_expired_cookie() {
        let config = test_config();
        let cookie = clear_refresh_cookie(&config);
        assert!(cookie.contains("refresh_token="));
        assert!(cookie.contains("Max-Age=0"));
        assert!(cookie.contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }

    #[test]
    fn extract_refresh_cookie_reads_value() {
        let config = test_config();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("foo=bar; refresh_token=mytoken; other=value"));

        let value = extract_refresh_cookie(&headers, &config);
        assert_eq!(value.as_deref(), Some("mytoken"));
    }

    #[test]
    fn extract_refresh_cookie_handles_missing_header() {
        let config = test_config();
        let headers = HeaderMap::new();
        assert!(extract_refresh_cookie(&headers, &config).is_none());
    }
}
