mod support;

use anyhow::Result;
use common_security::rbac::Principal;
use support::{build_test_app_state, grant_permission_to_user, seed_test_user, TestDatabase};
use uuid::Uuid;

fn principal_with_roles(tenant_id: Uuid, user_id: Uuid, role_ids: Vec<Uuid>) -> Principal {
    Principal { id: user_id, tenant_id, active: true, role_ids }
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn create_user_is_denied_without_users_write() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-1").await?;
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![]);

    let err = state
        .admin
        .create_user(&caller, seeded.tenant_id, "nobody@example.com", "irrelevant")
        .await
        .unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::ForbiddenMissingRole { .. }));

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn create_user_rejects_a_weak_password() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let role_id = grant_permission_to_user(&pool, seeded.tenant_id, seeded.user_id, "users:write").await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-2").await?;
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![role_id]);

    let err = state
        .admin
        .create_user(&caller, seeded.tenant_id, "new-user@example.com", "short")
        .await
        .unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::BadRequest { code, .. } if code == "weak_password"));

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn create_user_succeeds_with_users_write_and_a_strong_password() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let role_id = grant_permission_to_user(&pool, seeded.tenant_id, seeded.user_id, "users:write").await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-3").await?;
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![role_id]);

    let created = state
        .admin
        .create_user(&caller, seeded.tenant_id, "new-user@example.com", "Str0ng!Passw0rd")
        .await?;
    assert_eq!(created.email, "new-user@example.com");
    assert!(created.is_active);
    assert!(!created.mfa_enabled);

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn reset_password_allows_self_service_without_users_write() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-4").await?;
    // No roles at all: resetting someone else's password must be denied, but
    // resetting your own is always permitted.
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![]);

    state.admin.reset_password(&caller, seeded.user_id, "An0ther!StrongPass").await?;

    let other_user_id = Uuid::new_v4();
    let err = state.admin.reset_password(&caller, other_user_id, "An0ther!StrongPass").await.unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::ForbiddenMissingRole { .. }));

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn role_lifecycle_with_cycle_and_in_use_guards() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let admin_role_id = grant_permission_to_user(&pool, seeded.tenant_id, seeded.user_id, "roles:write").await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-5").await?;
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![admin_role_id]);

    let parent = state.admin.create_role(&caller, seeded.tenant_id, "manager", None).await?;
    let child = state.admin.create_role(&caller, seeded.tenant_id, "clerk", None).await?;

    state.admin.set_role_parent(&caller, seeded.tenant_id, child.id, Some(parent.id)).await?;

    // Pointing the parent's parent back at the child would close a cycle.
    let err = state.admin.set_role_parent(&caller, seeded.tenant_id, parent.id, Some(child.id)).await.unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::Conflict { code, .. } if code == "role_cycle"));

    // The role granting `roles:write` to the caller is in use (assigned via
    // user_roles), so deleting it must be refused.
    let err = state.admin.delete_role(&caller, admin_role_id).await.unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::Conflict { code, .. } if code == "role_in_use"));

    // An unused leaf role can be deleted once its parent link is cleared.
    state.admin.set_role_parent(&caller, seeded.tenant_id, child.id, None).await?;
    state.admin.delete_role(&caller, child.id).await?;

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn update_user_changes_email_and_is_denied_without_users_write() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let role_id = grant_permission_to_user(&pool, seeded.tenant_id, seeded.user_id, "users:write").await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-7").await?;
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![role_id]);

    let updated = state.admin.update_user(&caller, seeded.user_id, Some("changed@example.com")).await?;
    assert_eq!(updated.email, "changed@example.com");

    let unprivileged = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![]);
    let err = state.admin.update_user(&unprivileged, seeded.user_id, Some("nope@example.com")).await.unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::ForbiddenMissingRole { .. }));

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn list_and_get_user_require_users_read_and_nest_role_permissions() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let role_id = grant_permission_to_user(&pool, seeded.tenant_id, seeded.user_id, "users:read").await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-8").await?;
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![role_id]);

    let users = state.admin.list_users(&caller, seeded.tenant_id, Default::default()).await?;
    assert!(users.iter().any(|u| u.id == seeded.user_id));

    let detail = state.admin.get_user(&caller, seeded.user_id).await?;
    assert_eq!(detail.user.id, seeded.user_id);
    let granted_role = detail.roles.iter().find(|r| r.id == role_id).expect("caller's own role must be present");
    assert!(granted_role.permissions.iter().any(|p| p == "users:read"));

    let unprivileged = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![]);
    let err = state.admin.list_users(&unprivileged, seeded.tenant_id, Default::default()).await.unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::ForbiddenMissingRole { .. }));

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn role_list_get_and_update_round_trip() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let role_id = grant_permission_to_user(&pool, seeded.tenant_id, seeded.user_id, "roles:write").await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-9").await?;
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![role_id]);

    let created = state.admin.create_role(&caller, seeded.tenant_id, "auditor", Some("reads everything")).await?;

    let roles = state.admin.list_roles(&caller, seeded.tenant_id).await?;
    assert!(roles.iter().any(|r| r.id == created.id));

    let fetched = state.admin.get_role(&caller, created.id).await?;
    assert_eq!(fetched.name, "auditor");

    let updated = state
        .admin
        .update_role(&caller, created.id, Some("senior-auditor"), None)
        .await?;
    assert_eq!(updated.name, "senior-auditor");
    assert_eq!(updated.description.as_deref(), Some("reads everything"));

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn permission_list_get_and_update_round_trip() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let role_id = grant_permission_to_user(&pool, seeded.tenant_id, seeded.user_id, "permissions:write").await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-10").await?;
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![role_id]);

    let created = state.admin.create_permission(&caller, seeded.tenant_id, "reports:write", None).await?;

    let permissions = state.admin.list_permissions(&caller, seeded.tenant_id).await?;
    assert!(permissions.iter().any(|p| p.id == created.id));

    let fetched = state.admin.get_permission(&caller, created.id).await?;
    assert_eq!(fetched.name, "reports:write");

    let updated = state.admin.update_permission(&caller, created.id, Some("can write reports")).await?;
    assert_eq!(updated.description.as_deref(), Some("can write reports"));

    db.teardown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn permission_attach_and_detach_round_trip() -> Result<()> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(());
    };
    let pool = db.pool_clone();
    let seeded = seed_test_user(&pool).await?;
    let permissions_role_id = grant_permission_to_user(&pool, seeded.tenant_id, seeded.user_id, "permissions:write").await?;
    let roles_role_id = grant_permission_to_user(&pool, seeded.tenant_id, seeded.user_id, "roles:write").await?;
    let state = build_test_app_state(&pool, "admin-flow-kid-6").await?;
    let caller = principal_with_roles(seeded.tenant_id, seeded.user_id, vec![permissions_role_id, roles_role_id]);

    let permission = state.admin.create_permission(&caller, seeded.tenant_id, "reports:read", None).await?;

    state.admin.attach_permission(&caller, seeded.tenant_id, roles_role_id, permission.id).await?;
    state.admin.detach_permission(&caller, seeded.tenant_id, roles_role_id, permission.id).await?;
    state.admin.delete_permission(&caller, permission.id).await?;

    db.teardown().await?;
    Ok(())
}
