//! `TokenService`: issues and consumes the access/refresh token pair (spec §4.2).
//!
//! Grounded on this file's original `TokenSigner` (claim shape, refresh-token
//! hashing scheme, single-use consumption) generalized to delegate signing
//! material to [`crate::keyring::KeyRing`] instead of owning a key itself, and to
//! consult [`crate::cache::FastCache`] for the access-token denylist and
//! refresh-token reuse detection spec §4.2/§4.9 require.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, Header};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::cache::FastCache;
use crate::keyring::KeyRing;

pub struct TokenConfig {
    pub issuer: String,
    pub audience: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

pub struct TokenService {
    pool: PgPool,
    keyring: std::sync::Arc<KeyRing>,
    cache: FastCache,
    config: TokenConfig,
}

pub struct TokenSubject {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub roles: Vec<String>,
}

pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub access_expires_in: i64,
    pub refresh_expires_in: i64,
    pub token_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct RefreshedSubject {
    pub jti: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

#[derive(Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    tid: String,
    roles: Vec<String>,
    iss: String,
    aud: String,
    exp: i64,
    iat: i64,
    jti: String,
}

impl TokenService {
    pub fn new(pool: PgPool, keyring: std::sync::Arc<KeyRing>, cache: FastCache, config: TokenConfig) -> Self {
        Self { pool, keyring, cache, config }
    }

    /// `issue(subject)` from spec §4.2: signs a fresh access token and persists a
    /// hashed, single-use refresh token in the same call (not transactional with
    /// the caller's UoW — refresh tokens are a side channel the spec treats as
    /// independent of the aggregate write, per §4.2's "issuance is not rolled back
    /// by a later failure in the same request" note).
    pub async fn issue(&self, subject: TokenSubject) -> Result<IssuedTokens> {
        let now = Utc::now();
        let access_exp = now + Duration::seconds(self.config.access_ttl_seconds);
        let refresh_exp = now + Duration::seconds(self.config.refresh_ttl_seconds);

        let (kid, encoding_key) = self.keyring.current_signer();
        let claims = AccessClaims {
            sub: subject.user_id.to_string(),
            tid: subject.tenant_id.to_string(),
            roles: subject.roles,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            exp: access_exp.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid);
        let access_token = encode(&header, &claims, &encoding_key)
            .map_err(|err| anyhow!("failed to sign access token: {err}"))?;

        let refresh_token = Self::generate_refresh_token();
        let refresh_hash = Self::hash_refresh_token(&refresh_token);
        let refresh_jti = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO auth_refresh_tokens (jti, user_id, tenant_id, token_hash, issued_at, expires_at, consumed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NULL)",
        )
        .bind(refresh_jti)
        .bind(subject.user_id)
        .bind(subject.tenant_id)
        .bind(refresh_hash.as_slice())
        .bind(now)
        .bind(refresh_exp)
        .execute(&self.pool)
        .await
        .map_err(|err| anyhow!("failed to persist refresh token: {err}"))?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            access_expires_at: access_exp,
            refresh_expires_at: refresh_exp,
            access_expires_in: self.config.access_ttl_seconds,
            refresh_expires_in: self.config.refresh_ttl_seconds,
            token_type: "Bearer",
        })
    }

    /// `consumeRefreshToken(token)` — spec §4.2/§4.9's replay defense: a refresh
    /// token already marked consumed but still unexpired being presented again
    /// means it leaked, so every outstanding refresh token for that subject is
    /// revoked rather than just rejecting the one request.
    pub async fn consume_refresh_token(&self, token: &str) -> Result<Option<RefreshedSubject>> {
        if token.trim().is_empty() {
            return Ok(None);
        }
        let hash = Self::hash_refresh_token(token);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query!(
            r#"SELECT jti, user_id, tenant_id, expires_at, consumed_at FROM auth_refresh_tokens
               WHERE token_hash = $1 FOR UPDATE"#,
            hash.as_slice()
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        if row.consumed_at.is_some() {
            Self::revoke_all_for_user(&mut tx, row.user_id).await?;
            tx.commit().await?;
            return Ok(None);
        }

        sqlx::query!("UPDATE auth_refresh_tokens SET consumed_at = now() WHERE jti = $1", row.jti)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if row.expires_at <= Utc::now() {
            return Ok(None);
        }

        Ok(Some(RefreshedSubject {
            jti: row.jti,
            user_id: row.user_id,
            tenant_id: row.tenant_id,
        }))
    }

    async fn revoke_all_for_user(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<()> {
        sqlx::query!(
            "UPDATE auth_refresh_tokens SET consumed_at = now() WHERE user_id = $1 AND consumed_at IS NULL",
            user_id
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Adds `jti` to the denylist for the remainder of its access-token lifetime
    /// (spec §4.2's logout/admin-revoke path).
    pub async fn deny_access_jti(&self, jti: &str) -> Result<()> {
        self.cache
            .deny(jti, self.config.access_ttl_seconds.max(0) as u64)
            .await
    }

    pub async fn is_access_jti_denied(&self, jti: &str) -> Result<bool> {
        self.cache.is_denied(jti).await
    }

    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.config.refresh_ttl_seconds
    }

    pub async fn jwks(&self) -> Result<Vec<crate::keyring::JwkKey>> {
        self.keyring.publish_jwks().await
    }

    fn generate_refresh_token() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let random = URL_SAFE_NO_PAD.encode(bytes);
        format!("{}.{}", Uuid::new_v4(), random)
    }

    fn hash_refresh_token(token: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hasher.finalize().to_vec()
    }
}
