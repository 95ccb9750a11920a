//! `AdminCoordinator`: user/role/permission management use cases, spec §4.10.
//!
//! Grounded on `user_handlers.rs::create_user`/`update_user`/`reset_user_password`
//! (argon2 hashing on write, `QueryBuilder` dynamic updates) generalized to also
//! cover role/permission CRUD, which the reference workspace never had — that half
//! is grounded on `original_source/.../servicios.py::ServicioRoles` (create/update/
//! delete role, attach/detach permission, set-parent-with-cycle-check) and
//! `repositorios_roles.py::esta_en_uso` (role-in-use delete guard).

use std::sync::Arc;

use common_audit::{AuditActor, AuditProducer, AuditSeverity};
use common_http_errors::ApiError;
use common_security::cache::PermissionCache;
use common_security::graph;
use common_security::rbac::{Principal, RBACEvaluator};
use sqlx::PgPool;
use uuid::Uuid;

use super::{map_anyhow, map_repo_error};
use crate::password::PasswordVault;
use crate::repository::{
    Pagination, PermissionRecord, PermissionRepository, PgPermissionRepository, PgRoleRepository,
    PgUserRepository, RoleRecord, RoleRepository, UserRecord, UserRepository,
};
use crate::uow::UnitOfWork;

/// One role in a user's detail view, its permissions resolved to names so a
/// caller can see effective grants without a second round trip (spec §4.7's
/// eager-load rule, applied to `GET /users/{id}`'s nested response shape).
#[derive(Debug, Clone)]
pub struct RoleWithPermissions {
    pub id: Uuid,
    pub name: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UserDetail {
    pub user: UserRecord,
    pub roles: Vec<RoleWithPermissions>,
}

/// Minimum password strength the distilled spec is silent on but
/// `original_source`'s `hasher.py::SecurityConstants.PASSWORD_REGEX` enforces:
/// at least 12 characters, one uppercase letter, one digit, one special
/// character. Adopted per SPEC_FULL.md §9 as a supplemental validation rule.
fn validate_password_strength(password: &str) -> Result<(), ApiError> {
    let long_enough = password.len() >= 12;
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| !c.is_ascii_alphanumeric());
    if long_enough && has_upper && has_digit && has_special {
        Ok(())
    } else {
        Err(ApiError::bad_request("weak_password", None))
    }
}

pub struct AdminCoordinator {
    pool: PgPool,
    passwords: Arc<PasswordVault>,
    rbac: Arc<RBACEvaluator>,
    permission_cache: Arc<PermissionCache>,
    audit: Option<AuditProducer>,
    users: PgUserRepository,
    roles: PgRoleRepository,
    permissions: PgPermissionRepository,
}

impl AdminCoordinator {
    pub fn new(
        pool: PgPool,
        passwords: Arc<PasswordVault>,
        rbac: Arc<RBACEvaluator>,
        permission_cache: Arc<PermissionCache>,
        audit: Option<AuditProducer>,
    ) -> Self {
        Self {
            pool,
            passwords,
            rbac,
            permission_cache,
            audit,
            users: PgUserRepository,
            roles: PgRoleRepository,
            permissions: PgPermissionRepository,
        }
    }

    async fn require(&self, caller: &Principal, permission: &str) -> Result<(), ApiError> {
        let granted = self
            .rbac
            .has_permission(caller, permission)
            .await
            .map_err(|e| map_anyhow(e, None))?;
        if granted {
            Ok(())
        } else {
            self.emit_denial_audit(caller, "rbac.denied").await;
            Err(ApiError::ForbiddenMissingRole { role: permission_static(permission), trace_id: None })
        }
    }

    pub async fn create_user(&self, caller: &Principal, tenant_id: Uuid, email: &str, password: &str) -> Result<UserRecord, ApiError> {
        self.require(caller, "users:write").await?;
        validate_password_strength(password)?;
        // Argon2 hashing is CPU-hard by design; spec §5 requires it run on a
        // blocking-pool thread rather than stall the async task.
        let hash = self.hash_password_blocking(password).await?;

        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let user = self
            .users
            .insert(uow.conn(), tenant_id, email, &hash)
            .await
            .map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(user)
    }

    pub async fn list_users(&self, caller: &Principal, tenant_id: Uuid, page: Pagination) -> Result<Vec<UserRecord>, ApiError> {
        self.require(caller, "users:read").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let users = self.users.list(uow.conn(), tenant_id, page).await.map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(users)
    }

    /// `GET /users/{id}`: resolves the user's roles and each role's permission
    /// names, so the response shows the caller's effective grants directly
    /// instead of forcing a client to join role IDs to names itself.
    pub async fn get_user(&self, caller: &Principal, user_id: Uuid) -> Result<UserDetail, ApiError> {
        self.require(caller, "users:read").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let user = self
            .users
            .find_by_id(uow.conn(), user_id)
            .await
            .map_err(|e| map_repo_error(e, None))?
            .ok_or(ApiError::NotFound { code: "user_not_found", trace_id: None })?;

        let mut roles = Vec::with_capacity(user.role_ids.len());
        for role_id in &user.role_ids {
            let Some(role) = self.roles.find_by_id(uow.conn(), *role_id).await.map_err(|e| map_repo_error(e, None))? else {
                continue;
            };
            let mut permissions = Vec::with_capacity(role.permission_ids.len());
            for permission_id in &role.permission_ids {
                if let Some(permission) = self
                    .permissions
                    .find_by_id(uow.conn(), *permission_id)
                    .await
                    .map_err(|e| map_repo_error(e, None))?
                {
                    permissions.push(permission.name);
                }
            }
            permissions.sort();
            roles.push(RoleWithPermissions { id: role.id, name: role.name, permissions });
        }
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(UserDetail { user, roles })
    }

    pub async fn update_user(&self, caller: &Principal, user_id: Uuid, email: Option<&str>) -> Result<UserRecord, ApiError> {
        self.require(caller, "users:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.users.update(uow.conn(), user_id, email).await.map_err(|e| map_repo_error(e, None))?;
        let user = self
            .users
            .find_by_id(uow.conn(), user_id)
            .await
            .map_err(|e| map_repo_error(e, None))?
            .ok_or(ApiError::NotFound { code: "user_not_found", trace_id: None })?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(user)
    }

    pub async fn set_user_active(&self, caller: &Principal, user_id: Uuid, active: bool) -> Result<(), ApiError> {
        self.require(caller, "users:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.users
            .set_active(uow.conn(), user_id, active)
            .await
            .map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))
    }

    /// Self-service password change is always permitted (spec §4.10's
    /// "admin-of-self" exception); changing someone else's password requires
    /// `users:write`.
    pub async fn reset_password(&self, caller: &Principal, target_user_id: Uuid, new_password: &str) -> Result<(), ApiError> {
        if caller.id != target_user_id {
            self.require(caller, "users:write").await?;
        }
        validate_password_strength(new_password)?;
        let hash = self.hash_password_blocking(new_password).await?;

        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.users
            .update_password(uow.conn(), target_user_id, &hash)
            .await
            .map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))
    }

    pub async fn assign_role(&self, caller: &Principal, user_id: Uuid, role_id: Uuid) -> Result<(), ApiError> {
        self.require(caller, "users:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.users
            .assign_role(uow.conn(), user_id, role_id)
            .await
            .map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))
    }

    pub async fn revoke_role(&self, caller: &Principal, user_id: Uuid, role_id: Uuid) -> Result<(), ApiError> {
        self.require(caller, "users:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.users
            .revoke_role(uow.conn(), user_id, role_id)
            .await
            .map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))
    }

    pub async fn create_role(&self, caller: &Principal, tenant_id: Uuid, name: &str, description: Option<&str>) -> Result<RoleRecord, ApiError> {
        self.require(caller, "roles:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let role = self
            .roles
            .insert(uow.conn(), tenant_id, name, description)
            .await
            .map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(role)
    }

    pub async fn list_roles(&self, caller: &Principal, tenant_id: Uuid) -> Result<Vec<RoleRecord>, ApiError> {
        self.require(caller, "roles:read").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let roles = self.roles.list(uow.conn(), tenant_id).await.map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(roles)
    }

    pub async fn get_role(&self, caller: &Principal, role_id: Uuid) -> Result<RoleRecord, ApiError> {
        self.require(caller, "roles:read").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let role = self
            .roles
            .find_by_id(uow.conn(), role_id)
            .await
            .map_err(|e| map_repo_error(e, None))?
            .ok_or(ApiError::NotFound { code: "role_not_found", trace_id: None })?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(role)
    }

    pub async fn update_role(&self, caller: &Principal, role_id: Uuid, name: Option<&str>, description: Option<&str>) -> Result<RoleRecord, ApiError> {
        self.require(caller, "roles:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.roles.update(uow.conn(), role_id, name, description).await.map_err(|e| map_repo_error(e, None))?;
        let role = self
            .roles
            .find_by_id(uow.conn(), role_id)
            .await
            .map_err(|e| map_repo_error(e, None))?
            .ok_or(ApiError::NotFound { code: "role_not_found", trace_id: None })?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(role)
    }

    pub async fn delete_role(&self, caller: &Principal, role_id: Uuid) -> Result<(), ApiError> {
        self.require(caller, "roles:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        if self.roles.is_in_use(uow.conn(), role_id).await.map_err(|e| map_repo_error(e, None))? {
            uow.rollback().await.map_err(|e| map_anyhow(e, None))?;
            return Err(ApiError::conflict("role_in_use", None));
        }
        self.roles.delete(uow.conn(), role_id).await.map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        self.permission_cache.invalidate(role_id);
        Ok(())
    }

    /// `ServicioRoles.agregar_herencia` equivalent: re-reads the tenant's role
    /// graph inside the write transaction, rejects the assignment if it would
    /// close a cycle (spec §4.6), and invalidates every descendant's cached
    /// permission set on success.
    pub async fn set_role_parent(&self, caller: &Principal, tenant_id: Uuid, role_id: Uuid, parent_id: Option<Uuid>) -> Result<(), ApiError> {
        self.require(caller, "roles:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let graph = self.roles.load_graph(uow.conn(), tenant_id).await.map_err(|e| map_repo_error(e, None))?;

        if let Some(candidate) = parent_id {
            if graph::would_create_cycle(role_id, candidate, &graph) {
                uow.rollback().await.map_err(|e| map_anyhow(e, None))?;
                return Err(ApiError::conflict("role_cycle", None));
            }
        }

        self.roles.set_parent(uow.conn(), role_id, parent_id).await.map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;

        let descendants = graph::descendants_of(role_id, &graph);
        self.permission_cache.invalidate_with_descendants(role_id, &descendants);
        Ok(())
    }

    pub async fn attach_permission(&self, caller: &Principal, tenant_id: Uuid, role_id: Uuid, permission_id: Uuid) -> Result<(), ApiError> {
        self.require(caller, "roles:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.roles
            .attach_permission(uow.conn(), role_id, permission_id)
            .await
            .map_err(|e| map_repo_error(e, None))?;
        let graph = self.roles.load_graph(uow.conn(), tenant_id).await.map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        let descendants = graph::descendants_of(role_id, &graph);
        self.permission_cache.invalidate_with_descendants(role_id, &descendants);
        Ok(())
    }

    pub async fn detach_permission(&self, caller: &Principal, tenant_id: Uuid, role_id: Uuid, permission_id: Uuid) -> Result<(), ApiError> {
        self.require(caller, "roles:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.roles
            .detach_permission(uow.conn(), role_id, permission_id)
            .await
            .map_err(|e| map_repo_error(e, None))?;
        let graph = self.roles.load_graph(uow.conn(), tenant_id).await.map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        let descendants = graph::descendants_of(role_id, &graph);
        self.permission_cache.invalidate_with_descendants(role_id, &descendants);
        Ok(())
    }

    pub async fn create_permission(&self, caller: &Principal, tenant_id: Uuid, name: &str, description: Option<&str>) -> Result<PermissionRecord, ApiError> {
        self.require(caller, "permissions:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let permission = self
            .permissions
            .insert(uow.conn(), tenant_id, name, description)
            .await
            .map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(permission)
    }

    pub async fn list_permissions(&self, caller: &Principal, tenant_id: Uuid) -> Result<Vec<PermissionRecord>, ApiError> {
        self.require(caller, "permissions:read").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let permissions = self.permissions.list(uow.conn(), tenant_id).await.map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(permissions)
    }

    pub async fn get_permission(&self, caller: &Principal, permission_id: Uuid) -> Result<PermissionRecord, ApiError> {
        self.require(caller, "permissions:read").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        let permission = self
            .permissions
            .find_by_id(uow.conn(), permission_id)
            .await
            .map_err(|e| map_repo_error(e, None))?
            .ok_or(ApiError::NotFound { code: "permission_not_found", trace_id: None })?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(permission)
    }

    /// A description edit never changes the permission's name, so unlike role
    /// mutations this never needs to touch `permission_cache`.
    pub async fn update_permission(&self, caller: &Principal, permission_id: Uuid, description: Option<&str>) -> Result<PermissionRecord, ApiError> {
        self.require(caller, "permissions:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.permissions.update(uow.conn(), permission_id, description).await.map_err(|e| map_repo_error(e, None))?;
        let permission = self
            .permissions
            .find_by_id(uow.conn(), permission_id)
            .await
            .map_err(|e| map_repo_error(e, None))?
            .ok_or(ApiError::NotFound { code: "permission_not_found", trace_id: None })?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        Ok(permission)
    }

    pub async fn delete_permission(&self, caller: &Principal, permission_id: Uuid) -> Result<(), ApiError> {
        self.require(caller, "permissions:write").await?;
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, None))?;
        self.permissions.delete(uow.conn(), permission_id).await.map_err(|e| map_repo_error(e, None))?;
        uow.commit().await.map_err(|e| map_anyhow(e, None))?;
        self.permission_cache.invalidate_all();
        Ok(())
    }

    async fn hash_password_blocking(&self, password: &str) -> Result<String, ApiError> {
        let vault = self.passwords.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || vault.hash(&password))
            .await
            .map_err(|e| map_anyhow(anyhow::anyhow!(e), None))?
            .map_err(|e| map_anyhow(e, None))
    }

    async fn emit_denial_audit(&self, caller: &Principal, action: &str) {
        if let Some(audit) = &self.audit {
            let _ = audit
                .emit(
                    caller.tenant_id,
                    AuditActor { id: Some(caller.id), name: None, email: None },
                    "admin",
                    None,
                    action,
                    "auth-service",
                    AuditSeverity::Warning,
                    None,
                    serde_json::json!({}),
                    serde_json::json!({}),
                )
                .await;
        }
    }
}

fn permission_static(permission: &str) -> &'static str {
    match permission {
        "users:write" => "users:write",
        "users:read" => "users:read",
        "roles:write" => "roles:write",
        "roles:read" => "roles:read",
        "permissions:write" => "permissions:write",
        "permissions:read" => "permissions:read",
        _ => "permission_denied",
    }
}
