use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::RepoError;

#[derive(Debug, Clone)]
pub struct PermissionRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

/// `name` must match `scope:action` where both parts are `[a-z]+`, or `action` is
/// the literal wildcard `*` (spec §3). `*:*` is the universal grant.
pub fn is_valid_permission_name(name: &str) -> bool {
    let Some((scope, action)) = name.split_once(':') else {
        return false;
    };
    let scope_ok = scope == "*" || (!scope.is_empty() && scope.chars().all(|c| c.is_ascii_lowercase()));
    let action_ok = action == "*" || (!action.is_empty() && action.chars().all(|c| c.is_ascii_lowercase()));
    scope_ok && action_ok
}

#[async_trait]
pub trait PermissionRepository: Send + Sync {
    async fn find_by_id(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<PermissionRecord>, RepoError>;
    async fn find_by_natural_key(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, name: &str) -> Result<Option<PermissionRecord>, RepoError>;
    async fn list(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid) -> Result<Vec<PermissionRecord>, RepoError>;
    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, name: &str, description: Option<&str>) -> Result<PermissionRecord, RepoError>;
    async fn update(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, description: Option<&str>) -> Result<(), RepoError>;
    async fn delete(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), RepoError>;
}

pub struct PgPermissionRepository;

#[derive(sqlx::FromRow)]
struct PermissionRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    description: Option<String>,
}

impl From<PermissionRow> for PermissionRecord {
    fn from(row: PermissionRow) -> Self {
        PermissionRecord {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            description: row.description,
        }
    }
}

#[async_trait]
impl PermissionRepository for PgPermissionRepository {
    async fn find_by_id(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<PermissionRecord>, RepoError> {
        let row = sqlx::query_as!(
            PermissionRow,
            "SELECT id, tenant_id, name, description FROM permissions WHERE id = $1",
            id
        )
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_by_natural_key(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, name: &str) -> Result<Option<PermissionRecord>, RepoError> {
        let row = sqlx::query_as!(
            PermissionRow,
            "SELECT id, tenant_id, name, description FROM permissions WHERE tenant_id = $1 AND name = $2",
            tenant_id,
            name
        )
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid) -> Result<Vec<PermissionRecord>, RepoError> {
        let rows = sqlx::query_as!(
            PermissionRow,
            "SELECT id, tenant_id, name, description FROM permissions WHERE tenant_id = $1 ORDER BY name",
            tenant_id
        )
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, name: &str, description: Option<&str>) -> Result<PermissionRecord, RepoError> {
        if !is_valid_permission_name(name) {
            return Err(RepoError::Other(anyhow::anyhow!("invalid permission name '{name}'")));
        }
        let row = sqlx::query_as!(
            PermissionRow,
            r#"INSERT INTO permissions (id, tenant_id, name, description)
               VALUES (gen_random_uuid(), $1, $2, $3)
               RETURNING id, tenant_id, name, description"#,
            tenant_id,
            name,
            description
        )
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.into())
    }

    async fn update(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, description: Option<&str>) -> Result<(), RepoError> {
        sqlx::query!("UPDATE permissions SET description = $1 WHERE id = $2", description, id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn delete(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), RepoError> {
        sqlx::query!("DELETE FROM permissions WHERE id = $1", id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_scope_action_shape() {
        assert!(is_valid_permission_name("users:read"));
        assert!(is_valid_permission_name("*:*"));
        assert!(is_valid_permission_name("users:*"));
        assert!(!is_valid_permission_name("*:Read"));
        assert!(!is_valid_permission_name("users"));
        assert!(!is_valid_permission_name("Users:read"));
    }
}
