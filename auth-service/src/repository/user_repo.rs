use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{Pagination, RepoError};

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub mfa_enabled: bool,
    pub mfa_secret: Option<String>,
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub mfa_failed_attempts: i32,
    pub mfa_locked_until: Option<DateTime<Utc>>,
    pub password_set_at: DateTime<Utc>,
    /// Eagerly loaded per spec §4.7 ("relationships ... loaded eagerly when the
    /// operation's result type exposes them, to avoid lazy-load traps").
    pub role_ids: Vec<Uuid>,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<UserRecord>, RepoError>;
    async fn find_by_natural_key(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, email: &str) -> Result<Option<UserRecord>, RepoError>;
    async fn list(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, page: Pagination) -> Result<Vec<UserRecord>, RepoError>;
    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, email: &str, password_hash: &str) -> Result<UserRecord, RepoError>;

    /// Partial update: `None` leaves the field untouched (spec §4.7's
    /// `update_user` use case only ever edits the email today).
    async fn update(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, email: Option<&str>) -> Result<(), RepoError>;
    async fn update_password(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, password_hash: &str) -> Result<(), RepoError>;
    async fn set_active(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, active: bool) -> Result<(), RepoError>;
    async fn set_mfa_secret(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, secret: Option<&str>) -> Result<(), RepoError>;
    async fn set_mfa_enabled(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, enabled: bool) -> Result<(), RepoError>;

    /// `RECORD_FAIL` in the login state machine (spec §4.9): increments the
    /// counter and, if `lock_until` is `Some`, sets the lockout deadline in the
    /// same statement.
    async fn record_login_failure(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, lock_until: Option<DateTime<Utc>>) -> Result<i32, RepoError>;
    async fn record_mfa_failure(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, lock_until: Option<DateTime<Utc>>) -> Result<i32, RepoError>;
    /// `ISSUE`'s counter reset, performed in the same UoW as token issuance.
    async fn reset_failure_counters(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), RepoError>;

    async fn assign_role(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, role_id: Uuid) -> Result<(), RepoError>;
    async fn revoke_role(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, role_id: Uuid) -> Result<(), RepoError>;
    async fn role_ids_for(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<Vec<Uuid>, RepoError>;

    /// Replaces any existing recovery codes for the user with `hashes` (spec
    /// §4.4: regenerating recovery codes invalidates the previous set).
    async fn replace_recovery_codes(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, hashes: &[String]) -> Result<(), RepoError>;

    /// Consumes one unused recovery code matching `hash`. Returns `true` and
    /// marks it used if found, `false` otherwise. Must run inside the same
    /// transaction as the rest of the login flow to stay single-use under
    /// concurrent attempts.
    async fn consume_recovery_code(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, hash: &str) -> Result<bool, RepoError>;
}

pub struct PgUserRepository;

impl PgUserRepository {
    async fn load_role_ids(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<Vec<Uuid>, RepoError> {
        let rows = sqlx::query_scalar!(
            "SELECT role_id FROM user_roles WHERE user_id = $1",
            user_id
        )
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }

    fn row_to_record(row: UserRow, role_ids: Vec<Uuid>) -> UserRecord {
        UserRecord {
            id: row.id,
            tenant_id: row.tenant_id,
            email: row.email,
            password_hash: row.password_hash,
            is_active: row.is_active,
            mfa_enabled: row.mfa_enabled,
            mfa_secret: row.mfa_secret,
            failed_attempts: row.failed_attempts,
            locked_until: row.locked_until,
            mfa_failed_attempts: row.mfa_failed_attempts,
            mfa_locked_until: row.mfa_locked_until,
            password_set_at: row.password_set_at,
            role_ids,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    tenant_id: Uuid,
    email: String,
    password_hash: String,
    is_active: bool,
    mfa_enabled: bool,
    mfa_secret: Option<String>,
    failed_attempts: i32,
    locked_until: Option<DateTime<Utc>>,
    mfa_failed_attempts: i32,
    mfa_locked_until: Option<DateTime<Utc>>,
    password_set_at: DateTime<Utc>,
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_id(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<UserRecord>, RepoError> {
        let row = sqlx::query_as!(
            UserRow,
            r#"SELECT id, tenant_id, email, password_hash, is_active, mfa_enabled, mfa_secret,
                      failed_attempts, locked_until, mfa_failed_attempts, mfa_locked_until, password_set_at
               FROM users WHERE id = $1"#,
            id
        )
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(row) => {
                let role_ids = Self::load_role_ids(tx, row.id).await?;
                Ok(Some(Self::row_to_record(row, role_ids)))
            }
            None => Ok(None),
        }
    }

    async fn find_by_natural_key(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, email: &str) -> Result<Option<UserRecord>, RepoError> {
        let normalized = email.trim().to_ascii_lowercase();
        let row = sqlx::query_as!(
            UserRow,
            r#"SELECT id, tenant_id, email, password_hash, is_active, mfa_enabled, mfa_secret,
                      failed_attempts, locked_until, mfa_failed_attempts, mfa_locked_until, password_set_at
               FROM users WHERE tenant_id = $1 AND lower(email) = $2"#,
            tenant_id,
            normalized
        )
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(row) => {
                let role_ids = Self::load_role_ids(tx, row.id).await?;
                Ok(Some(Self::row_to_record(row, role_ids)))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, page: Pagination) -> Result<Vec<UserRecord>, RepoError> {
        let rows = sqlx::query_as!(
            UserRow,
            r#"SELECT id, tenant_id, email, password_hash, is_active, mfa_enabled, mfa_secret,
                      failed_attempts, locked_until, mfa_failed_attempts, mfa_locked_until, password_set_at
               FROM users WHERE tenant_id = $1 ORDER BY email LIMIT $2 OFFSET $3"#,
            tenant_id,
            page.limit,
            page.offset
        )
        .fetch_all(&mut **tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let role_ids = Self::load_role_ids(tx, row.id).await?;
            out.push(Self::row_to_record(row, role_ids));
        }
        Ok(out)
    }

    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid, email: &str, password_hash: &str) -> Result<UserRecord, RepoError> {
        let normalized = email.trim().to_ascii_lowercase();
        let row = sqlx::query_as!(
            UserRow,
            r#"INSERT INTO users (id, tenant_id, email, password_hash, is_active, mfa_enabled, failed_attempts, mfa_failed_attempts, password_set_at)
               VALUES (gen_random_uuid(), $1, $2, $3, TRUE, FALSE, 0, 0, now())
               RETURNING id, tenant_id, email, password_hash, is_active, mfa_enabled, mfa_secret,
                         failed_attempts, locked_until, mfa_failed_attempts, mfa_locked_until, password_set_at"#,
            tenant_id,
            normalized,
            password_hash
        )
        .fetch_one(&mut **tx)
        .await?;

        Ok(Self::row_to_record(row, Vec::new()))
    }

    async fn update(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, email: Option<&str>) -> Result<(), RepoError> {
        let normalized = email.map(|value| value.trim().to_ascii_lowercase());
        sqlx::query!(
            "UPDATE users SET email = COALESCE($1, email) WHERE id = $2",
            normalized,
            id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_password(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, password_hash: &str) -> Result<(), RepoError> {
        sqlx::query!(
            "UPDATE users SET password_hash = $1, password_set_at = now() WHERE id = $2",
            password_hash,
            id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn set_active(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, active: bool) -> Result<(), RepoError> {
        sqlx::query!("UPDATE users SET is_active = $1 WHERE id = $2", active, id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn set_mfa_secret(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, secret: Option<&str>) -> Result<(), RepoError> {
        sqlx::query!("UPDATE users SET mfa_secret = $1 WHERE id = $2", secret, id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn set_mfa_enabled(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, enabled: bool) -> Result<(), RepoError> {
        sqlx::query!("UPDATE users SET mfa_enabled = $1 WHERE id = $2", enabled, id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn record_login_failure(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, lock_until: Option<DateTime<Utc>>) -> Result<i32, RepoError> {
        let count = sqlx::query_scalar!(
            "UPDATE users SET failed_attempts = failed_attempts + 1, locked_until = COALESCE($1, locked_until) WHERE id = $2 RETURNING failed_attempts",
            lock_until,
            id
        )
        .fetch_one(&mut **tx)
        .await?;
        Ok(count)
    }

    async fn record_mfa_failure(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, lock_until: Option<DateTime<Utc>>) -> Result<i32, RepoError> {
        let count = sqlx::query_scalar!(
            "UPDATE users SET mfa_failed_attempts = mfa_failed_attempts + 1, mfa_locked_until = COALESCE($1, mfa_locked_until) WHERE id = $2 RETURNING mfa_failed_attempts",
            lock_until,
            id
        )
        .fetch_one(&mut **tx)
        .await?;
        Ok(count)
    }

    async fn reset_failure_counters(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), RepoError> {
        sqlx::query!(
            "UPDATE users SET failed_attempts = 0, locked_until = NULL, mfa_failed_attempts = 0, mfa_locked_until = NULL WHERE id = $1",
            id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn assign_role(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, role_id: Uuid) -> Result<(), RepoError> {
        sqlx::query!(
            "INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            user_id,
            role_id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn revoke_role(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, role_id: Uuid) -> Result<(), RepoError> {
        sqlx::query!(
            "DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2",
            user_id,
            role_id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn role_ids_for(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<Vec<Uuid>, RepoError> {
        Self::load_role_ids(tx, user_id).await
    }

    async fn replace_recovery_codes(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, hashes: &[String]) -> Result<(), RepoError> {
        sqlx::query!("DELETE FROM recovery_codes WHERE user_id = $1", user_id)
            .execute(&mut **tx)
            .await?;
        for hash in hashes {
            sqlx::query!(
                "INSERT INTO recovery_codes (id, user_id, code_hash, used_at) VALUES (gen_random_uuid(), $1, $2, NULL)",
                user_id,
                hash
            )
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn consume_recovery_code(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, hash: &str) -> Result<bool, RepoError> {
        let result = sqlx::query!(
            "UPDATE recovery_codes SET used_at = now() WHERE user_id = $1 AND code_hash = $2 AND used_at IS NULL",
            user_id,
            hash
        )
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
