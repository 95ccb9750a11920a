mod support;

use anyhow::Result;
use auth_service::auth_handlers::{login_user, logout_user, refresh_session};
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::Router;
use serde_json::json;
use support::{build_test_app_state, seed_test_user, TestDatabase};
use tower::util::ServiceExt;

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn session_flow_login_refresh_logout() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let state = build_test_app_state(&pool, "session-flow-kid").await?;

    let app = Router::new()
        .route("/auth/login", post(login_user))
        .route("/auth/refresh", post(refresh_session))
        .route("/auth/logout", post(logout_user))
        .with_state(state);

    let login_body = json!({
        "email": seeded.email,
        "password": seeded.password,
        "tenant_id": seeded.tenant_id,
        "mfa_code": null,
    })
    .to_string();
    let login_req = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(login_body))?;
    let login_resp = app.clone().oneshot(login_req).await?;
    assert_eq!(login_resp.status(), StatusCode::OK);
    let set_cookie = login_resp
        .headers()
        .get(SET_COOKIE)
        .ok_or_else(|| anyhow::anyhow!("missing refresh cookie"))?
        .to_str()?
        .to_string();
    assert!(set_cookie.contains("auth_refresh"));
    let cookie_pair = set_cookie.split(';').next().unwrap().to_string();
    let login_json: serde_json::Value =
        serde_json::from_slice(&axum::body::to_bytes(login_resp.into_body(), usize::MAX).await?)?;
    let access_token = login_json["access_token"].as_str().unwrap().to_string();

    let refresh_req = Request::builder()
        .method("POST")
        .uri("/auth/refresh")
        .header(COOKIE, &cookie_pair)
        .body(Body::empty())?;
    let refresh_resp = app.clone().oneshot(refresh_req).await?;
    assert_eq!(refresh_resp.status(), StatusCode::OK);
    let rotated_cookie = refresh_resp
        .headers()
        .get(SET_COOKIE)
        .ok_or_else(|| anyhow::anyhow!("missing rotated refresh cookie"))?
        .to_str()?
        .split(';')
        .next()
        .unwrap()
        .to_string();
    assert_ne!(rotated_cookie, cookie_pair, "refresh must rotate the cookie value");

    let logout_req = Request::builder()
        .method("POST")
        .uri("/auth/logout")
        .header(COOKIE, &rotated_cookie)
        .header(AUTHORIZATION, format!("Bearer {access_token}"))
        .body(Body::empty())?;
    let logout_resp = app.clone().oneshot(logout_req).await?;
    assert_eq!(logout_resp.status(), StatusCode::NO_CONTENT);

    let refresh_again_req = Request::builder()
        .method("POST")
        .uri("/auth/refresh")
        .header(COOKIE, &rotated_cookie)
        .body(Body::empty())?;
    let refresh_again_resp = app.clone().oneshot(refresh_again_req).await?;
    assert_eq!(refresh_again_resp.status(), StatusCode::UNAUTHORIZED);

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn reused_refresh_cookie_is_rejected() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let state = build_test_app_state(&pool, "session-flow-reuse-kid").await?;

    let app = Router::new()
        .route("/auth/login", post(login_user))
        .route("/auth/refresh", post(refresh_session))
        .with_state(state);

    let login_body = json!({
        "email": seeded.email,
        "password": seeded.password,
        "tenant_id": seeded.tenant_id,
        "mfa_code": null,
    })
    .to_string();
    let login_req = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(login_body))?;
    let login_resp = app.clone().oneshot(login_req).await?;
    let set_cookie = login_resp.headers().get(SET_COOKIE).unwrap().to_str()?;
    let cookie_pair = set_cookie.split(';').next().unwrap().to_string();

    let first_refresh = Request::builder()
        .method("POST")
        .uri("/auth/refresh")
        .header(COOKIE, &cookie_pair)
        .body(Body::empty())?;
    assert_eq!(app.clone().oneshot(first_refresh).await?.status(), StatusCode::OK);

    // Presenting the same (now-consumed) cookie again must fail.
    let replayed_refresh = Request::builder()
        .method("POST")
        .uri("/auth/refresh")
        .header(COOKIE, &cookie_pair)
        .body(Body::empty())?;
    assert_eq!(app.clone().oneshot(replayed_refresh).await?.status(), StatusCode::UNAUTHORIZED);

    db.teardown().await?;
    Ok(())
}
