use std::collections::HashSet;

use async_trait::async_trait;
use common_security::{RoleGraph, RoleGraphSource, RoleNode};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::RepoError;

#[derive(Debug, Clone)]
pub struct RoleRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_system_role: bool,
    pub parent_id: Option<Uuid>,
    pub permission_ids: HashSet<Uuid>,
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn find_by_id(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<RoleRecord>, RepoError>;
    async fn find_by_natural_key(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, name: &str) -> Result<Option<RoleRecord>, RepoError>;
    async fn list(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid) -> Result<Vec<RoleRecord>, RepoError>;
    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, name: &str, description: Option<&str>) -> Result<RoleRecord, RepoError>;

    /// Partial update: `None` leaves the field untouched.
    async fn update(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, name: Option<&str>, description: Option<&str>) -> Result<(), RepoError>;
    async fn delete(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), RepoError>;

    /// `esta_en_uso`: forbidden to delete while users hold it or child roles
    /// point at it as parent (spec §4.6's `RoleInUse`).
    async fn is_in_use(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<bool, RepoError>;

    /// `agregar_herencia`: caller has already run the DAG cycle check against a
    /// freshly loaded graph (see `common_security::graph::would_create_cycle`)
    /// before calling this.
    async fn set_parent(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, parent_id: Option<Uuid>) -> Result<(), RepoError>;

    async fn attach_permission(&self, tx: &mut Transaction<'_, Postgres>, role_id: Uuid, permission_id: Uuid) -> Result<(), RepoError>;
    async fn detach_permission(&self, tx: &mut Transaction<'_, Postgres>, role_id: Uuid, permission_id: Uuid) -> Result<(), RepoError>;

    /// Whole-tenant role graph, used both for the cycle check and to seed
    /// `PermissionCache` misses.
    async fn load_graph(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid) -> Result<RoleGraph, RepoError>;
}

pub struct PgRoleRepository;

#[derive(sqlx::FromRow)]
struct RoleRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    description: Option<String>,
    is_system_role: bool,
    parent_id: Option<Uuid>,
}

impl PgRoleRepository {
    async fn permission_ids_for(tx: &mut Transaction<'_, Postgres>, role_id: Uuid) -> Result<HashSet<Uuid>, RepoError> {
        let rows = sqlx::query_scalar!(
            "SELECT permission_id FROM role_permissions WHERE role_id = $1",
            role_id
        )
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn permission_names_for(tx: &mut Transaction<'_, Postgres>, role_id: Uuid) -> Result<HashSet<String>, RepoError> {
        let rows = sqlx::query_scalar!(
            r#"SELECT p.name FROM role_permissions rp
               JOIN permissions p ON p.id = rp.permission_id
               WHERE rp.role_id = $1"#,
            role_id
        )
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows.into_iter().collect())
    }

    fn row_to_record(row: RoleRow, permission_ids: HashSet<Uuid>) -> RoleRecord {
        RoleRecord {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            description: row.description,
            is_system_role: row.is_system_role,
            parent_id: row.parent_id,
            permission_ids,
        }
    }
}

#[async_trait]
impl RoleRepository for PgRoleRepository {
    async fn find_by_id(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<RoleRecord>, RepoError> {
        let row = sqlx::query_as!(
            RoleRow,
            "SELECT id, tenant_id, name, description, is_system_role, parent_id FROM roles WHERE id = $1",
            id
        )
        .fetch_optional(&mut **tx)
        .await?;
        match row {
            Some(row) => {
                let perms = Self::permission_ids_for(tx, row.id).await?;
                Ok(Some(Self::row_to_record(row, perms)))
            }
            None => Ok(None),
        }
    }

    async fn find_by_natural_key(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, name: &str) -> Result<Option<RoleRecord>, RepoError> {
        let row = sqlx::query_as!(
            RoleRow,
            "SELECT id, tenant_id, name, description, is_system_role, parent_id FROM roles WHERE tenant_id = $1 AND name = $2",
            tenant_id,
            name
        )
        .fetch_optional(&mut **tx)
        .await?;
        match row {
            Some(row) => {
                let perms = Self::permission_ids_for(tx, row.id).await?;
                Ok(Some(Self::row_to_record(row, perms)))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid) -> Result<Vec<RoleRecord>, RepoError> {
        let rows = sqlx::query_as!(
            RoleRow,
            "SELECT id, tenant_id, name, description, is_system_role, parent_id FROM roles WHERE tenant_id = $1 ORDER BY name",
            tenant_id
        )
        .fetch_all(&mut **tx)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let perms = Self::permission_ids_for(tx, row.id).await?;
            out.push(Self::row_to_record(row, perms));
        }
        Ok(out)
    }

    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, name: &str, description: Option<&str>) -> Result<RoleRecord, RepoError> {
        let row = sqlx::query_as!(
            RoleRow,
            r#"INSERT INTO roles (id, tenant_id, name, description, is_system_role, parent_id)
               VALUES (gen_random_uuid(), $1, $2, $3, FALSE, NULL)
               RETURNING id, tenant_id, name, description, is_system_role, parent_id"#,
            tenant_id,
            name,
            description
        )
        .fetch_one(&mut **tx)
        .await?;
        Ok(Self::row_to_record(row, HashSet::new()))
    }

    async fn update(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, name: Option<&str>, description: Option<&str>) -> Result<(), RepoError> {
        sqlx::query!(
            "UPDATE roles SET name = COALESCE($1, name), description = COALESCE($2, description) WHERE id = $3",
            name,
            description,
            id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), RepoError> {
        let row = sqlx::query_scalar!("SELECT is_system_role FROM roles WHERE id = $1", id)
            .fetch_optional(&mut **tx)
            .await?;
        match row {
            Some(true) => return Err(RepoError::Other(anyhow::anyhow!("system role cannot be deleted"))),
            Some(false) => {}
            None => return Err(RepoError::NotFound),
        }
        sqlx::query!("DELETE FROM roles WHERE id = $1", id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn is_in_use(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<bool, RepoError> {
        let has_users = sqlx::query_scalar!(
            "SELECT EXISTS(SELECT 1 FROM user_roles WHERE role_id = $1)",
            id
        )
        .fetch_one(&mut **tx)
        .await?
        .unwrap_or(false);
        if has_users {
            return Ok(true);
        }
        let has_children = sqlx::query_scalar!(
            "SELECT EXISTS(SELECT 1 FROM roles WHERE parent_id = $1)",
            id
        )
        .fetch_one(&mut **tx)
        .await?
        .unwrap_or(false);
        Ok(has_children)
    }

    async fn set_parent(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, parent_id: Option<Uuid>) -> Result<(), RepoError> {
        sqlx::query!("UPDATE roles SET parent_id = $1 WHERE id = $2", parent_id, id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn attach_permission(&self, tx: &mut Transaction<'_, Postgres>, role_id: Uuid, permission_id: Uuid) -> Result<(), RepoError> {
        sqlx::query!(
            "INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            role_id,
            permission_id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn detach_permission(&self, tx: &mut Transaction<'_, Postgres>, role_id: Uuid, permission_id: Uuid) -> Result<(), RepoError> {
        sqlx::query!(
            "DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = $2",
            role_id,
            permission_id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn load_graph(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid) -> Result<RoleGraph, RepoError> {
        let rows = sqlx::query_as!(
            RoleRow,
            "SELECT id, tenant_id, name, description, is_system_role, parent_id FROM roles WHERE tenant_id = $1",
            tenant_id
        )
        .fetch_all(&mut **tx)
        .await?;

        let mut graph = RoleGraph::new();
        for row in rows {
            let permissions = Self::permission_names_for(tx, row.id).await?;
            graph.insert(
                row.id,
                RoleNode {
                    id: row.id,
                    name: row.name,
                    parent_id: row.parent_id,
                    permissions,
                },
            );
        }
        Ok(graph)
    }
}

/// Pool-backed (not UoW-scoped) graph loader for `RBACEvaluator`'s read path —
/// spec §4.6 treats RBAC evaluation as outside any write transaction.
pub struct PgRoleGraphLoader {
    pub pool: PgPool,
}

#[async_trait]
impl RoleGraphSource for PgRoleGraphLoader {
    async fn load_role_graph(&self, tenant_id: Uuid) -> anyhow::Result<RoleGraph> {
        let mut tx = self.pool.begin().await?;
        let graph = PgRoleRepository.load_graph(&mut tx, tenant_id).await?;
        tx.rollback().await?;
        Ok(graph)
    }
}
