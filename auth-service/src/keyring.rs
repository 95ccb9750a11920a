//! `KeyRing`: the signing-key lifecycle from spec §4.1 — exactly one
//! active-signing key, zero or more verify-only keys, retired keys pruned after
//! their grace window.
//!
//! Grounded on `auth_service::tokens::TokenSigner` (its `load_active_key`/`jwks`
//! DB access and JWK composition, generalized here from "one active key, static
//! dev fallback" to the full three-state lifecycle) and
//! `original_source/.../jwks_manager.py` (`key_rotation_interval`,
//! `key_grace_period`, `_clean_expired_keys` naming the rotation/grace semantics).

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand_core::OsRng as RandOsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    ActiveSigning,
    VerifyOnly,
    Retired,
}

impl KeyState {
    fn as_db_str(self) -> &'static str {
        match self {
            KeyState::ActiveSigning => "active_signing",
            KeyState::VerifyOnly => "verify_only",
            KeyState::Retired => "retired",
        }
    }

    fn from_db_str(s: &str) -> Self {
        match s {
            "active_signing" => KeyState::ActiveSigning,
            "verify_only" => KeyState::VerifyOnly,
            _ => KeyState::Retired,
        }
    }
}

#[derive(Clone, Serialize)]
pub struct JwkKey {
    pub kty: &'static str,
    #[serde(rename = "use")]
    pub use_: &'static str,
    pub kid: String,
    pub alg: String,
    pub n: String,
    pub e: String,
}

struct SigningMaterial {
    kid: String,
    encoding_key: EncodingKey,
}

struct VerifyMaterial {
    decoding_key: DecodingKey,
}

/// Owns every `SigningKey`. One instance is shared across the process (behind an
/// `Arc`); `rotate()` is invoked by a background task on `KEY_ROTATION_INTERVAL_DAYS`.
pub struct KeyRing {
    pool: PgPool,
    signing: RwLock<SigningMaterial>,
    verifiers: RwLock<HashMap<String, VerifyMaterial>>,
}

impl KeyRing {
    /// Loads the current active-signing key and all verify-only keys from
    /// `auth_signing_keys`. Per spec §4.1, a missing/unreadable active-signing key
    /// on the signing node is fatal — the service refuses to start.
    pub async fn load(pool: PgPool) -> Result<Self> {
        let active_row = sqlx::query(
            "SELECT kid, private_pem FROM auth_signing_keys WHERE state = 'active_signing' ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&pool)
        .await
        .context("failed to query active signing key")?
        .ok_or_else(|| anyhow!("no active-signing key in auth_signing_keys; service cannot start"))?;

        let kid: String = active_row.try_get("kid")?;
        let private_pem: String = active_row.try_get("private_pem")?;
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|err| anyhow!("active-signing key {kid} is unreadable: {err}"))?;

        let ring = Self {
            pool,
            signing: RwLock::new(SigningMaterial { kid, encoding_key }),
            verifiers: RwLock::new(HashMap::new()),
        };
        ring.reload_verifiers().await?;
        Ok(ring)
    }

    /// Re-reads every non-retired key's public material into the in-memory
    /// verifier cache. A verify-only key that fails to parse only breaks
    /// validations referencing that KID (spec §4.1's weaker failure mode),
    /// not startup.
    async fn reload_verifiers(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT kid, n, e FROM auth_signing_keys WHERE state IN ('active_signing', 'verify_only')",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to query verify-only keys")?;

        let mut verifiers = HashMap::new();
        for row in rows {
            let kid: String = row.try_get("kid")?;
            let n: String = row.try_get("n")?;
            let e: String = row.try_get("e")?;
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(decoding_key) => {
                    verifiers.insert(kid, VerifyMaterial { decoding_key });
                }
                Err(err) => {
                    tracing::warn!(kid = %kid, error = %err, "Failed to load verify-only key; tokens referencing it will fail validation");
                }
            }
        }
        *self.verifiers.write().expect("keyring verifiers lock poisoned") = verifiers;
        Ok(())
    }

    /// `currentSigner()` — the active key's KID and an `EncodingKey` ready to sign.
    pub fn current_signer(&self) -> (String, EncodingKey) {
        let signing = self.signing.read().expect("keyring signing lock poisoned");
        (signing.kid.clone(), signing.encoding_key.clone())
    }

    /// `verifierFor(kid)` — public material for a presented token's KID, or `None`.
    pub fn verifier_for(&self, kid: &str) -> Option<DecodingKey> {
        let verifiers = self.verifiers.read().expect("keyring verifiers lock poisoned");
        verifiers.get(kid).map(|m| m.decoding_key.clone())
    }

    /// `publishJWKS()` — every active-signing and verify-only key's public material.
    pub async fn publish_jwks(&self) -> Result<Vec<JwkKey>> {
        let rows = sqlx::query(
            "SELECT kid, alg, n, e FROM auth_signing_keys WHERE state IN ('active_signing', 'verify_only') ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(JwkKey {
                kty: "RSA",
                use_: "sig",
                kid: row.try_get("kid")?,
                alg: row.try_get("alg")?,
                n: row.try_get("n")?,
                e: row.try_get("e")?,
            });
        }
        if keys.is_empty() {
            return Err(anyhow!("no signing keys available for JWKS response"));
        }
        Ok(keys)
    }

    /// `rotate()` — spec §4.1: generate a new key, promote it to active-signing,
    /// demote the previous active-signing key to verify-only with `retires_at`
    /// equal to the longest-lived refresh-token lifetime, prune keys past
    /// `retires_at + grace`. The new KID is published (row inserted, in-memory
    /// verifier cache updated) before the old KID loses signing privilege, so
    /// in-flight tokens are never left unverifiable.
    pub async fn rotate(&self, refresh_ttl: Duration, grace: Duration) -> Result<String> {
        let (kid, private_pem, n, e) = Self::generate_keypair()?;
        let now = Utc::now();
        let retires_at = now + refresh_ttl;

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE auth_signing_keys SET state = 'verify_only', retires_at = $1 WHERE state = 'active_signing'")
            .bind(retires_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO auth_signing_keys (kid, alg, private_pem, n, e, state, created_at, expires_at, retires_at) \
             VALUES ($1, 'RS256', $2, $3, $4, 'active_signing', $5, $5, NULL)",
        )
        .bind(&kid)
        .bind(&private_pem)
        .bind(&n)
        .bind(&e)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let prune_before = now - grace;
        sqlx::query("UPDATE auth_signing_keys SET state = 'retired' WHERE state = 'verify_only' AND retires_at IS NOT NULL AND retires_at < $1")
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM auth_signing_keys WHERE state = 'retired' AND retires_at < $1")
            .bind(prune_before)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|err| anyhow!("freshly generated key {kid} failed to parse: {err}"))?;
        *self.signing.write().expect("keyring signing lock poisoned") = SigningMaterial {
            kid: kid.clone(),
            encoding_key,
        };
        self.reload_verifiers().await?;

        Ok(kid)
    }

    /// Whether the active-signing key is older than `interval` (spec §4.1's
    /// rotation cadence). The background rotation task polls this rather than
    /// rotating unconditionally on its own tick.
    pub async fn should_rotate(&self, interval: Duration) -> Result<bool> {
        let created_at: chrono::DateTime<Utc> = sqlx::query_scalar(
            "SELECT created_at FROM auth_signing_keys WHERE state = 'active_signing' ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to read active signing key age")?;
        Ok(Utc::now() - created_at >= interval)
    }

    fn generate_keypair() -> Result<(String, String, String, String)> {
        let private_key = RsaPrivateKey::new(&mut RandOsRng, RSA_KEY_BITS)
            .map_err(|err| anyhow!("failed to generate RSA key: {err}"))?;
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| anyhow!("failed to encode private key: {err}"))?
            .to_string();
        let public_key = private_key.to_public_key();
        // Drop the unused PEM encoding result; we only need n/e for JWKS here.
        let _ = public_key.to_public_key_pem(LineEnding::LF);
        let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
        let kid = Uuid::new_v4().to_string();
        Ok((kid, private_pem, n, e))
    }
}

impl KeyState {
    pub fn label(self) -> &'static str {
        self.as_db_str()
    }

    pub fn parse(s: &str) -> Self {
        Self::from_db_str(s)
    }
}
