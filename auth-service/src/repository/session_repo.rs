use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::RepoError;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_fingerprint: Option<String>,
    pub client_ip: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn find_by_id(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<SessionRecord>, RepoError>;
    async fn list_for_user(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<Vec<SessionRecord>, RepoError>;

    /// Created on successful login (spec §3's `ActiveSession`).
    async fn create(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, device_fingerprint: Option<&str>, client_ip: Option<&str>, expires_at: DateTime<Utc>) -> Result<SessionRecord, RepoError>;

    /// Refreshed on token refresh.
    async fn touch(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, expires_at: DateTime<Utc>) -> Result<(), RepoError>;

    /// Removed on logout or expiry.
    async fn delete(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), RepoError>;
    async fn delete_expired(&self, tx: &mut Transaction<'_, Postgres>, now: DateTime<Utc>) -> Result<u64, RepoError>;
}

pub struct PgSessionRepository;

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    device_fingerprint: Option<String>,
    client_ip: Option<String>,
    last_activity_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        SessionRecord {
            id: row.id,
            user_id: row.user_id,
            device_fingerprint: row.device_fingerprint,
            client_ip: row.client_ip,
            last_activity_at: row.last_activity_at,
            expires_at: row.expires_at,
        }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn find_by_id(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<SessionRecord>, RepoError> {
        let row = sqlx::query_as!(
            SessionRow,
            "SELECT id, user_id, device_fingerprint, client_ip, last_activity_at, expires_at FROM active_sessions WHERE id = $1",
            id
        )
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_for_user(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<Vec<SessionRecord>, RepoError> {
        let rows = sqlx::query_as!(
            SessionRow,
            "SELECT id, user_id, device_fingerprint, client_ip, last_activity_at, expires_at FROM active_sessions WHERE user_id = $1 ORDER BY last_activity_at DESC",
            user_id
        )
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create(&self, tx: &mut Transaction<'_, Postgres>, user_id: Uuid, device_fingerprint: Option<&str>, client_ip: Option<&str>, expires_at: DateTime<Utc>) -> Result<SessionRecord, RepoError> {
        let row = sqlx::query_as!(
            SessionRow,
            r#"INSERT INTO active_sessions (id, user_id, device_fingerprint, client_ip, last_activity_at, expires_at)
               VALUES (gen_random_uuid(), $1, $2, $3, now(), $4)
               RETURNING id, user_id, device_fingerprint, client_ip, last_activity_at, expires_at"#,
            user_id,
            device_fingerprint,
            client_ip,
            expires_at
        )
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.into())
    }

    async fn touch(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid, expires_at: DateTime<Utc>) -> Result<(), RepoError> {
        sqlx::query!(
            "UPDATE active_sessions SET last_activity_at = now(), expires_at = $1 WHERE id = $2",
            expires_at,
            id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), RepoError> {
        sqlx::query!("DELETE FROM active_sessions WHERE id = $1", id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn delete_expired(&self, tx: &mut Transaction<'_, Postgres>, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query!("DELETE FROM active_sessions WHERE expires_at < $1", now)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}
