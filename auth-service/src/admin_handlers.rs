//! CRUD `/users`, `/roles`, `/permissions` (spec §6), thin shims over
//! `AdminCoordinator`. Grounded on the reference workspace's `create_user`/
//! `list_users`/`update_user`/`reset_user_password` (kept the handler shape:
//! `State`/`Path`/`Json` extractors, tenant header, per-route RBAC check)
//! generalized from a single `role` column to many-to-many role assignment.

use axum::extract::{Path, Query, State};
use axum::Json;
use common_auth::AuthContext;
use common_http_errors::{ApiError, ApiResult};
use common_security::Principal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::admin::UserDetail;
use crate::repository::{Pagination, PermissionRecord, RoleRecord, UserRecord};
use crate::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl From<ListQuery> for Pagination {
    fn from(query: ListQuery) -> Self {
        let default = Pagination::default();
        Pagination {
            limit: query.limit.unwrap_or(default.limit),
            offset: query.offset.unwrap_or(default.offset),
        }
    }
}

fn principal_from(auth: &AuthContext) -> Principal {
    let role_ids = auth
        .claims
        .roles
        .iter()
        .filter_map(|raw| Uuid::parse_str(raw).ok())
        .collect();
    Principal {
        id: auth.claims.subject,
        tenant_id: auth.claims.tenant_id,
        active: true,
        role_ids,
    }
}

#[derive(Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub mfa_enabled: bool,
    pub role_ids: Vec<Uuid>,
}

impl From<UserRecord> for UserResponse {
    fn from(u: UserRecord) -> Self {
        Self { id: u.id, tenant_id: u.tenant_id, email: u.email, is_active: u.is_active, mfa_enabled: u.mfa_enabled, role_ids: u.role_ids }
    }
}

#[derive(Serialize)]
pub struct RoleWithPermissionsResponse {
    pub id: Uuid,
    pub name: String,
    pub permissions: Vec<String>,
}

/// Nested role-with-permissions shape for `GET /users/{id}`, so the response
/// shows the caller's effective grants instead of bare role IDs.
#[derive(Serialize)]
pub struct UserDetailResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub mfa_enabled: bool,
    pub roles: Vec<RoleWithPermissionsResponse>,
}

impl From<UserDetail> for UserDetailResponse {
    fn from(detail: UserDetail) -> Self {
        Self {
            id: detail.user.id,
            tenant_id: detail.user.tenant_id,
            email: detail.user.email,
            is_active: detail.user.is_active,
            mfa_enabled: detail.user.mfa_enabled,
            roles: detail
                .roles
                .into_iter()
                .map(|r| RoleWithPermissionsResponse { id: r.id, name: r.name, permissions: r.permissions })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub tenant_id: Uuid,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub password: String,
}

#[derive(Deserialize)]
pub struct RoleIdPayload {
    pub role_id: Uuid,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
}

pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<CreateUserRequest>,
) -> ApiResult<Json<UserResponse>> {
    let principal = principal_from(&auth);
    let user = state.admin.create_user(&principal, payload.tenant_id, &payload.email, &payload.password).await?;
    Ok(Json(user.into()))
}

pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<UserResponse>>> {
    let principal = principal_from(&auth);
    let tenant_id = principal.tenant_id;
    let users = state.admin.list_users(&principal, tenant_id, query.into()).await?;
    Ok(Json(users.into_iter().map(Into::into).collect()))
}

pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<UserDetailResponse>> {
    let principal = principal_from(&auth);
    let detail = state.admin.get_user(&principal, user_id).await?;
    Ok(Json(detail.into()))
}

pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<UpdateUserRequest>,
) -> ApiResult<Json<UserResponse>> {
    let principal = principal_from(&auth);
    let user = state.admin.update_user(&principal, user_id, payload.email.as_deref()).await?;
    Ok(Json(user.into()))
}

pub async fn set_user_active(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<SetActiveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = principal_from(&auth);
    state.admin.set_user_active(&principal, user_id, payload.active).await?;
    Ok(Json(serde_json::json!({ "id": user_id, "active": payload.active })))
}

pub async fn reset_user_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<ResetPasswordRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = principal_from(&auth);
    state.admin.reset_password(&principal, user_id, &payload.password).await?;
    Ok(Json(serde_json::json!({ "id": user_id, "password_reset": true })))
}

pub async fn assign_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<RoleIdPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = principal_from(&auth);
    state.admin.assign_role(&principal, user_id, payload.role_id).await?;
    Ok(Json(serde_json::json!({ "user_id": user_id, "role_id": payload.role_id, "assigned": true })))
}

pub async fn revoke_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = principal_from(&auth);
    state.admin.revoke_role(&principal, user_id, role_id).await?;
    Ok(Json(serde_json::json!({ "user_id": user_id, "role_id": role_id, "revoked": true })))
}

#[derive(Serialize)]
pub struct RoleResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
}

impl From<RoleRecord> for RoleResponse {
    fn from(r: RoleRecord) -> Self {
        Self { id: r.id, tenant_id: r.tenant_id, name: r.name, description: r.description, parent_id: r.parent_id }
    }
}

#[derive(Deserialize)]
pub struct CreateRoleRequest {
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct SetParentRequest {
    pub tenant_id: Uuid,
    pub parent_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct UpdateRoleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

pub async fn create_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<CreateRoleRequest>,
) -> ApiResult<Json<RoleResponse>> {
    let principal = principal_from(&auth);
    let role = state.admin.create_role(&principal, payload.tenant_id, &payload.name, payload.description.as_deref()).await?;
    Ok(Json(role.into()))
}

pub async fn list_roles(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<Vec<RoleResponse>>> {
    let principal = principal_from(&auth);
    let tenant_id = principal.tenant_id;
    let roles = state.admin.list_roles(&principal, tenant_id).await?;
    Ok(Json(roles.into_iter().map(Into::into).collect()))
}

pub async fn get_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(role_id): Path<Uuid>,
) -> ApiResult<Json<RoleResponse>> {
    let principal = principal_from(&auth);
    let role = state.admin.get_role(&principal, role_id).await?;
    Ok(Json(role.into()))
}

pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(role_id): Path<Uuid>,
    Json(payload): Json<UpdateRoleRequest>,
) -> ApiResult<Json<RoleResponse>> {
    let principal = principal_from(&auth);
    let role = state
        .admin
        .update_role(&principal, role_id, payload.name.as_deref(), payload.description.as_deref())
        .await?;
    Ok(Json(role.into()))
}

pub async fn delete_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(role_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = principal_from(&auth);
    state.admin.delete_role(&principal, role_id).await?;
    Ok(Json(serde_json::json!({ "id": role_id, "deleted": true })))
}

pub async fn set_role_parent(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(role_id): Path<Uuid>,
    Json(payload): Json<SetParentRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = principal_from(&auth);
    state.admin.set_role_parent(&principal, payload.tenant_id, role_id, payload.parent_id).await?;
    Ok(Json(serde_json::json!({ "id": role_id, "parent_id": payload.parent_id })))
}

#[derive(Deserialize)]
pub struct AttachPermissionRequest {
    pub tenant_id: Uuid,
    pub permission_id: Uuid,
}

pub async fn attach_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(role_id): Path<Uuid>,
    Json(payload): Json<AttachPermissionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = principal_from(&auth);
    state.admin.attach_permission(&principal, payload.tenant_id, role_id, payload.permission_id).await?;
    Ok(Json(serde_json::json!({ "role_id": role_id, "permission_id": payload.permission_id, "attached": true })))
}

pub async fn detach_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((role_id, permission_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let tenant_id = payload
        .get("tenant_id")
        .and_then(|v| v.as_str())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| ApiError::bad_request("missing_tenant_id", None))?;
    let principal = principal_from(&auth);
    state.admin.detach_permission(&principal, tenant_id, role_id, permission_id).await?;
    Ok(Json(serde_json::json!({ "role_id": role_id, "permission_id": permission_id, "attached": false })))
}

#[derive(Serialize)]
pub struct PermissionResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

impl From<PermissionRecord> for PermissionResponse {
    fn from(p: PermissionRecord) -> Self {
        Self { id: p.id, tenant_id: p.tenant_id, name: p.name, description: p.description }
    }
}

#[derive(Deserialize)]
pub struct CreatePermissionRequest {
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdatePermissionRequest {
    pub description: Option<String>,
}

pub async fn create_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<CreatePermissionRequest>,
) -> ApiResult<Json<PermissionResponse>> {
    let principal = principal_from(&auth);
    let permission = state.admin.create_permission(&principal, payload.tenant_id, &payload.name, payload.description.as_deref()).await?;
    Ok(Json(permission.into()))
}

pub async fn list_permissions(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<Vec<PermissionResponse>>> {
    let principal = principal_from(&auth);
    let tenant_id = principal.tenant_id;
    let permissions = state.admin.list_permissions(&principal, tenant_id).await?;
    Ok(Json(permissions.into_iter().map(Into::into).collect()))
}

pub async fn get_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(permission_id): Path<Uuid>,
) -> ApiResult<Json<PermissionResponse>> {
    let principal = principal_from(&auth);
    let permission = state.admin.get_permission(&principal, permission_id).await?;
    Ok(Json(permission.into()))
}

pub async fn update_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(permission_id): Path<Uuid>,
    Json(payload): Json<UpdatePermissionRequest>,
) -> ApiResult<Json<PermissionResponse>> {
    let principal = principal_from(&auth);
    let permission = state.admin.update_permission(&principal, permission_id, payload.description.as_deref()).await?;
    Ok(Json(permission.into()))
}

pub async fn delete_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(permission_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = principal_from(&auth);
    state.admin.delete_permission(&principal, permission_id).await?;
    Ok(Json(serde_json::json!({ "id": permission_id, "deleted": true })))
}
