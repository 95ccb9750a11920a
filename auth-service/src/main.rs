use anyhow::Context;
use auth_service::AppState;
use axum::{
    extract::State,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, StatusCode,
    },
    middleware,
    response::Response,
    routing::{delete, get, patch, post},
    Json, Router,
};
use common_audit::{AuditProducer, AuditProducerConfig};
use common_auth::{JwtConfig, JwtVerifier};
use common_security::cache::PermissionCache;
use common_security::rbac::RBACEvaluator;
use rdkafka::producer::FutureProducer;
use reqwest::Client;
use sqlx::PgPool;
use std::{env, fs, net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    time::{interval, Duration, MissedTickBehavior},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use auth_service::admin_handlers::{
    assign_role, attach_permission, create_permission, create_role, create_user,
    delete_permission, delete_role, detach_permission, get_permission, get_role, get_user,
    list_permissions, list_roles, list_users, reset_user_password, revoke_role, set_role_parent,
    set_user_active, update_permission, update_role, update_user,
};
use auth_service::app::reject_denied_access_token;
use auth_service::auth_handlers::{login_user, logout_user, refresh_session};
use auth_service::cache::FastCache;
use auth_service::config::load_auth_config;
use auth_service::coordinator::admin::AdminCoordinator;
use auth_service::coordinator::auth::AuthCoordinator;
use auth_service::keyring::{JwkKey, KeyRing};
use auth_service::metrics::AuthMetrics;
use auth_service::mfa_handlers::{begin_mfa_enrollment, verify_mfa_enrollment};
use auth_service::notifications::KafkaProducer;
use auth_service::password::PasswordVault;
use auth_service::repository::PgRoleGraphLoader;
use auth_service::tokens::{TokenConfig, TokenService};

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
                .body(axum::body::Body::from("metrics unavailable"))
                .expect("failed to build metrics response")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let db_pool = PgPool::connect(&database_url).await?;

    let jwt_verifier = build_jwt_verifier_from_env().await?;
    spawn_jwks_refresh(jwt_verifier.clone());

    let auth_config = Arc::new(load_auth_config()?);
    info!(
        mfa_issuer = %auth_config.mfa_issuer,
        key_rotation_interval_days = auth_config.key_rotation_interval_days,
        "Loaded auth-service configuration"
    );

    let metrics = Arc::new(AuthMetrics::new()?);

    let keyring = Arc::new(KeyRing::load(db_pool.clone()).await?);
    spawn_key_rotation(keyring.clone(), auth_config.clone(), metrics.clone());

    let cache = FastCache::from_url_or_in_memory(auth_config.cache_url.as_deref()).await;

    let passwords = Arc::new(PasswordVault::new(
        auth_config.pepper.clone(),
        auth_config.password_hash_cost,
    )?);

    let token_config = TokenConfig {
        issuer: env::var("JWT_ISSUER").context("JWT_ISSUER must be set")?,
        audience: env::var("JWT_AUDIENCE").context("JWT_AUDIENCE must be set")?,
        access_ttl_seconds: env::var("TOKEN_ACCESS_TTL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(900),
        refresh_ttl_seconds: env::var("TOKEN_REFRESH_TTL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(2_592_000),
    };
    let token_service = Arc::new(TokenService::new(
        db_pool.clone(),
        keyring.clone(),
        cache.clone(),
        token_config,
    ));

    let kafka_bootstrap = env::var("KAFKA_BOOTSTRAP")
        .or_else(|_| env::var("KAFKA_BROKERS"))
        .unwrap_or_else(|_| "localhost:9092".to_string());

    let kafka_client: FutureProducer = rdkafka::ClientConfig::new()
        .set("bootstrap.servers", &kafka_bootstrap)
        .create()
        .context("Failed to create Kafka producer")?;

    let audit_topic =
        env::var("SECURITY_AUDIT_TOPIC").unwrap_or_else(|_| "security.audit.events".to_string());
    let audit_producer = Some(AuditProducer::new(
        Some(kafka_client.clone()),
        AuditProducerConfig { topic: audit_topic },
    ));

    let permission_cache = Arc::new(PermissionCache::default());
    let role_graph_loader = Arc::new(PgRoleGraphLoader { pool: db_pool.clone() });
    let rbac = Arc::new(RBACEvaluator::new(
        role_graph_loader,
        permission_cache.clone(),
        audit_producer.clone(),
    ));

    let auth = Arc::new(AuthCoordinator::new(
        db_pool.clone(),
        token_service.clone(),
        cache.clone(),
        passwords.clone(),
        auth_config.clone(),
    ));

    let admin = Arc::new(AdminCoordinator::new(
        db_pool.clone(),
        passwords.clone(),
        rbac.clone(),
        permission_cache,
        audit_producer,
    ));

    let http_client = Client::builder()
        .build()
        .context("Failed to build HTTP client")?;

    let state = AppState {
        db: db_pool,
        jwt_verifier,
        token_service,
        keyring,
        cache,
        passwords,
        rbac,
        auth,
        admin,
        config: auth_config,
        kafka_producer: kafka_client,
        http_client,
        metrics,
    };

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://localhost:3001"),
            HeaderValue::from_static("http://localhost:5173"),
        ]))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("authorization"),
        ])
        .allow_credentials(true);

    // Routes behind this point require a bearer token whose JTI is not on the
    // denylist (spec §4.2 step 4) in addition to the AuthContext extractor's
    // own signature/claim checks.
    let protected = Router::new()
        .route("/auth/logout", post(logout_user))
        .route("/auth/mfa/setup", post(begin_mfa_enrollment))
        .route("/auth/mfa/verify", post(verify_mfa_enrollment))
        .route("/users", post(create_user).get(list_users))
        .route("/users/{user_id}", get(get_user).patch(update_user))
        .route("/users/{user_id}/active", patch(set_user_active))
        .route("/users/{user_id}/password", post(reset_user_password))
        .route("/users/{user_id}/roles", post(assign_role))
        .route("/users/{user_id}/roles/{role_id}", delete(revoke_role))
        .route("/roles", post(create_role).get(list_roles))
        .route(
            "/roles/{role_id}",
            delete(delete_role).get(get_role).patch(update_role),
        )
        .route("/roles/{role_id}/parent", patch(set_role_parent))
        .route(
            "/roles/{role_id}/permissions",
            post(attach_permission),
        )
        .route(
            "/roles/{role_id}/permissions/{permission_id}",
            delete(detach_permission),
        )
        .route("/permissions", post(create_permission).get(list_permissions))
        .route(
            "/permissions/{permission_id}",
            delete(delete_permission)
                .get(get_permission)
                .patch(update_permission),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            reject_denied_access_token,
        ));

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/jwks.json", get(jwks))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/auth/login", post(login_user))
        .route("/auth/refresh", post(refresh_session))
        .merge(protected)
        .with_state(state)
        .layer(cors);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8085);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));

    println!("starting auth-service on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn build_jwt_verifier_from_env() -> anyhow::Result<Arc<JwtVerifier>> {
    let issuer = env::var("JWT_ISSUER").context("JWT_ISSUER must be set")?;
    let audience = env::var("JWT_AUDIENCE").context("JWT_AUDIENCE must be set")?;

    let mut config = JwtConfig::new(issuer, audience);
    if let Ok(value) = env::var("JWT_LEEWAY_SECONDS") {
        if let Ok(leeway) = value.parse::<u32>() {
            config = config.with_leeway(leeway);
        }
    }

    let mut builder = JwtVerifier::builder(config);

    if let Ok(url) = env::var("JWT_JWKS_URL") {
        info!(jwks_url = %url, "Configuring JWKS fetcher");
        builder = builder.with_jwks_url(url);
    }

    if let Some(pem) = read_secret_env("JWT_DEV_PUBLIC_KEY_PEM")? {
        warn!("Using JWT_DEV_PUBLIC_KEY_PEM for verification; do not enable in production");
        builder = builder
            .with_rsa_pem("local-dev", pem.as_bytes())
            .map_err(anyhow::Error::from)?;
    }

    let verifier = builder.build().await.map_err(anyhow::Error::from)?;

    info!("JWT verifier initialised");
    Ok(Arc::new(verifier))
}

fn read_secret_env(key: &str) -> anyhow::Result<Option<String>> {
    let file_var = format!("{}_FILE", key);
    if let Ok(path) = env::var(&file_var) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from {}", file_var, path))?;
        return Ok(Some(contents));
    }
    Ok(env::var(key).ok())
}

fn spawn_jwks_refresh(verifier: Arc<JwtVerifier>) {
    let Some(fetcher) = verifier.jwks_fetcher() else {
        return;
    };

    let refresh_secs = env::var("JWKS_REFRESH_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(300);
    let refresh_secs = refresh_secs.max(60);
    let interval_duration = Duration::from_secs(refresh_secs);
    let url = fetcher.url().to_owned();
    let handle = verifier.clone();

    tokio::spawn(async move {
        let mut ticker = interval(interval_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match handle.refresh_jwks().await {
                Ok(count) => {
                    debug!(count, jwks_url = %url, "Refreshed JWKS keys");
                }
                Err(err) => {
                    warn!(error = %err, jwks_url = %url, "Failed to refresh JWKS keys");
                }
            }
        }
    });
}

/// Background rotation per spec §4.1: once a day, checks whether the active
/// signing key has outlived `KEY_ROTATION_INTERVAL_DAYS` and rotates if so.
/// Runs independently of the access-token lifetime; old keys stay verify-only
/// for the full refresh-token grace window so in-flight tokens never break.
fn spawn_key_rotation(
    keyring: Arc<KeyRing>,
    config: Arc<auth_service::config::AuthConfig>,
    metrics: Arc<AuthMetrics>,
) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(24 * 60 * 60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let rotation_interval = chrono::Duration::days(config.key_rotation_interval_days);
        loop {
            ticker.tick().await;
            match keyring.should_rotate(rotation_interval).await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(err) => {
                    warn!(error = %err, "Failed to check signing key age");
                    continue;
                }
            }

            let refresh_ttl = chrono::Duration::days(config.key_rotation_interval_days);
            let grace = chrono::Duration::days(config.key_grace_days);
            match keyring.rotate(refresh_ttl, grace).await {
                Ok(kid) => {
                    info!(kid = %kid, "Rotated signing key");
                    metrics.key_rotation("success");
                }
                Err(err) => {
                    warn!(error = %err, "Signing key rotation failed");
                    metrics.key_rotation("failure");
                }
            }
        }
    });
}

async fn jwks(State(state): State<AppState>) -> Result<Json<JwksResponse>, StatusCode> {
    match state.keyring.publish_jwks().await {
        Ok(keys) => Ok(Json(JwksResponse { keys })),
        Err(err) => {
            warn!(error = %err, "Unable to load JWKS");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(serde::Serialize)]
struct JwksResponse {
    keys: Vec<JwkKey>,
}
