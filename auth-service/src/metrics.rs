use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct AuthMetrics {
    registry: Registry,
    login_attempts: IntCounterVec,
    mfa_events: IntCounterVec,
    token_events: IntCounterVec,
    rbac_denials: IntCounterVec,
    key_rotations: IntCounterVec,
    cache_events: IntCounterVec,
}

impl AuthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let login_attempts = IntCounterVec::new(
            Opts::new(
                "auth_login_attempts_total",
                "Count of login attempts grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(login_attempts.clone()))?;

        let mfa_events = IntCounterVec::new(
            Opts::new("auth_mfa_events_total", "Count of MFA-related events"),
            &["event"],
        )?;
        registry.register(Box::new(mfa_events.clone()))?;

        let token_events = IntCounterVec::new(
            Opts::new("auth_token_events_total", "Count of token issuance/revocation events"),
            &["event"],
        )?;
        registry.register(Box::new(token_events.clone()))?;

        let rbac_denials = IntCounterVec::new(
            Opts::new("auth_rbac_denials_total", "Count of permission checks that were denied"),
            &["permission"],
        )?;
        registry.register(Box::new(rbac_denials.clone()))?;

        let key_rotations = IntCounterVec::new(
            Opts::new("auth_key_rotations_total", "Count of signing key rotations"),
            &["result"],
        )?;
        registry.register(Box::new(key_rotations.clone()))?;

        let cache_events = IntCounterVec::new(
            Opts::new("auth_cache_events_total", "Count of cache hits/misses"),
            &["keyspace", "outcome"],
        )?;
        registry.register(Box::new(cache_events.clone()))?;

        Ok(Self {
            registry,
            login_attempts,
            mfa_events,
            token_events,
            rbac_denials,
            key_rotations,
            cache_events,
        })
    }

    pub fn login_attempt(&self, outcome: &str) {
        self.login_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn mfa_event(&self, event: &str) {
        self.mfa_events.with_label_values(&[event]).inc();
    }

    pub fn token_event(&self, event: &str) {
        self.token_events.with_label_values(&[event]).inc();
    }

    pub fn rbac_denial(&self, permission: &str) {
        self.rbac_denials.with_label_values(&[permission]).inc();
    }

    pub fn key_rotation(&self, result: &str) {
        self.key_rotations.with_label_values(&[result]).inc();
    }

    pub fn cache_event(&self, keyspace: &str, outcome: &str) {
        self.cache_events.with_label_values(&[keyspace, outcome]).inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
