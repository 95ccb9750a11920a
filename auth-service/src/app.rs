use std::sync::Arc;

use axum::extract::{FromRef, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use common_auth::{AuthContext, JwtVerifier};
use common_http_errors::ApiError;
use common_security::RBACEvaluator;
use rdkafka::producer::FutureProducer;
use reqwest::Client;
use sqlx::PgPool;
use tracing::warn;

use crate::cache::FastCache;
use crate::config::AuthConfig;
use crate::coordinator::admin::AdminCoordinator;
use crate::coordinator::auth::AuthCoordinator;
use crate::keyring::KeyRing;
use crate::metrics::AuthMetrics;
use crate::notifications::{
    post_suspicious_webhook, publish_mfa_activity, MfaActivityEvent, SuspiciousLoginPayload,
};
use crate::password::PasswordVault;
use crate::tokens::TokenService;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub jwt_verifier: Arc<JwtVerifier>,
    pub token_service: Arc<TokenService>,
    pub keyring: Arc<KeyRing>,
    pub cache: FastCache,
    pub passwords: Arc<PasswordVault>,
    pub rbac: Arc<RBACEvaluator>,
    pub auth: Arc<AuthCoordinator>,
    pub admin: Arc<AdminCoordinator>,
    pub config: Arc<AuthConfig>,
    pub kafka_producer: FutureProducer,
    pub http_client: Client,
    pub metrics: Arc<AuthMetrics>,
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_verifier.clone()
    }
}

impl FromRef<AppState> for Arc<TokenService> {
    fn from_ref(state: &AppState) -> Self {
        state.token_service.clone()
    }
}

impl FromRef<AppState> for Arc<AuthConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl FromRef<AppState> for Arc<RBACEvaluator> {
    fn from_ref(state: &AppState) -> Self {
        state.rbac.clone()
    }
}

impl FromRef<AppState> for Arc<AuthCoordinator> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

impl FromRef<AppState> for Arc<AdminCoordinator> {
    fn from_ref(state: &AppState) -> Self {
        state.admin.clone()
    }
}

impl AppState {
    pub fn record_login_metric(&self, outcome: &str) {
        self.metrics.login_attempt(outcome);
    }

    pub fn record_mfa_metric(&self, event: &str) {
        self.metrics.mfa_event(event);
    }

    pub fn record_token_metric(&self, event: &str) {
        self.metrics.token_event(event);
    }

    pub fn record_rbac_denial(&self, permission: &str) {
        self.metrics.rbac_denial(permission);
    }

    pub fn record_key_rotation_metric(&self, result: &str) {
        self.metrics.key_rotation(result);
    }

    pub fn record_cache_metric(&self, keyspace: &str, outcome: &str) {
        self.metrics.cache_event(keyspace, outcome);
    }

    pub async fn emit_mfa_activity(
        &self,
        event: MfaActivityEvent,
        webhook_message: Option<String>,
    ) {
        if let Err(err) = publish_mfa_activity(
            &self.kafka_producer,
            &self.config.mfa_activity_topic,
            &event,
        )
        .await
        {
            warn!(
                ?err,
                tenant_id = %event.tenant_id,
                trace_id = %event.trace_id,
                "Failed to publish MFA activity"
            );
        }

        if let Some(message) = webhook_message {
            if let Some(url) = &self.config.suspicious_webhook_url {
                if !url.is_empty() {
                    let bearer = self.config.suspicious_webhook_bearer.as_deref();
                    let payload = SuspiciousLoginPayload { text: message };
                    if let Err(err) =
                        post_suspicious_webhook(&self.http_client, url, bearer, &payload).await
                    {
                        warn!(
                            ?err,
                            trace_id = %event.trace_id,
                            "Failed to post suspicious login webhook"
                        );
                    }
                }
            }
        }
    }
}

/// Spec §4.2 step 4: rejects an otherwise-valid access token whose JTI is on
/// the denylist (logged out, or superseded by a refresh). `AuthContext`'s own
/// `FromRequestParts` only verifies the signature/claims; it has no reference
/// to `TokenService`, so the denylist check is layered on as middleware over
/// routes that accept bearer tokens rather than folded into the extractor.
pub async fn reject_denied_access_token(
    State(state): State<AppState>,
    auth: AuthContext,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let jti = auth
        .claims
        .raw
        .get("jti")
        .and_then(|v| v.as_str())
        .ok_or(ApiError::Unauthorized { code: "invalid_token", trace_id: None })?;

    let denied = state
        .token_service
        .is_access_jti_denied(jti)
        .await
        .map_err(|err| ApiError::internal(err, None))?;

    if denied {
        return Err(ApiError::Unauthorized { code: "token_revoked", trace_id: None });
    }

    Ok(next.run(request).await)
}
