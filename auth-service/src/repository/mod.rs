//! Persistence-ignorant repository ports, one per aggregate, per spec §4.7.
//!
//! Grounded on `original_source/.../repositorios_roles.py`'s method surface —
//! `obtener_por_id` -> `find_by_id`, `obtener_por_nombre` -> `find_by_natural_key`,
//! `guardar` -> `insert`/`update`, `eliminar` -> `delete`, `listar_todos` -> `list`,
//! `existe` -> `exists`, `esta_en_uso` -> `is_in_use`, `actualizar_permisos` /
//! `agregar_herencia` -> the permission/parent mutators on `RoleRepository` — and
//! on `auth_service::user_handlers`/`tenant_handlers`'s existing sqlx idioms
//! (`QueryBuilder` dynamic updates, `FromRow` structs), reused inside the impls.

pub mod permission_repo;
pub mod role_repo;
pub mod session_repo;
pub mod user_repo;

pub use permission_repo::{PermissionRecord, PermissionRepository, PgPermissionRepository};
pub use role_repo::{RoleRecord, RoleRepository, PgRoleRepository};
pub use session_repo::{SessionRecord, SessionRepository, PgSessionRepository};
pub use user_repo::{PgUserRepository, UserRecord, UserRepository};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("entity not found")]
    NotFound,
    #[error("unique constraint violated: {0}")]
    DuplicateKey(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // Postgres SQLSTATE 23505 = unique_violation; mirrors the check
            // already used ad hoc in `user_handlers.rs` for duplicate emails.
            if db_err.code().as_deref() == Some("23505") {
                return RepoError::DuplicateKey("unique constraint");
            }
        }
        if matches!(err, sqlx::Error::RowNotFound) {
            return RepoError::NotFound;
        }
        RepoError::Other(anyhow::Error::new(err))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}
