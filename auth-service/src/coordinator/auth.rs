//! `AuthCoordinator`: the login/refresh/logout/MFA state machine, spec §4.9.
//!
//! Grounded directly on `user_handlers.rs::login_user`/`refresh_session`/
//! `logout_user`, which already implement this exact state machine inline
//! against a bare `PgPool`; this factors that logic into a UoW/repository-driven
//! coordinator so the handlers become thin.

use std::sync::Arc;

use chrono::{Duration, Utc};
use common_http_errors::ApiError;
use sqlx::PgPool;
use uuid::Uuid;

use super::{map_anyhow, map_repo_error};
use crate::cache::FastCache;
use crate::config::AuthConfig;
use crate::mfa::{MFAEngine, MfaVerifyOutcome};
use crate::password::PasswordVault;
use crate::repository::{
    PgSessionRepository, PgUserRepository, SessionRepository, UserRecord, UserRepository,
};
use crate::tokens::{IssuedTokens, TokenService, TokenSubject};
use crate::uow::UnitOfWork;

pub struct LoginRequest {
    pub tenant_id: Uuid,
    pub email: String,
    pub password: String,
    pub mfa_code: Option<String>,
    pub trace_id: Uuid,
}

pub struct LoginOutcome {
    pub tokens: IssuedTokens,
    pub user_id: Uuid,
}

pub struct AuthCoordinator {
    pool: PgPool,
    tokens: Arc<TokenService>,
    cache: FastCache,
    passwords: Arc<PasswordVault>,
    mfa: MFAEngine,
    config: Arc<AuthConfig>,
    users: PgUserRepository,
    sessions: PgSessionRepository,
}

impl AuthCoordinator {
    pub fn new(
        pool: PgPool,
        tokens: Arc<TokenService>,
        cache: FastCache,
        passwords: Arc<PasswordVault>,
        config: Arc<AuthConfig>,
    ) -> Self {
        let mfa = MFAEngine::new(
            cache.clone(),
            config.mfa_window_steps,
            config.mfa_attempt_limit,
            config.login_lockout_seconds,
        );
        Self {
            pool,
            tokens,
            cache,
            passwords,
            mfa,
            config,
            users: PgUserRepository,
            sessions: PgSessionRepository,
        }
    }

    /// `CHECK_LOCK → CHECK_CREDS → CHECK_MFA → ISSUE` from spec §4.9. Every
    /// branch that reads or writes user state does so inside one UoW; the
    /// password hash never leaks which of "no such user" / "wrong password"
    /// applies (both collapse to `InvalidCredentials`).
    pub async fn login(&self, req: LoginRequest) -> Result<LoginOutcome, ApiError> {
        let trace_id = Some(req.trace_id);
        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, trace_id))?;

        let user = self
            .users
            .find_by_natural_key(uow.conn(), req.tenant_id, &req.email)
            .await
            .map_err(|e| map_repo_error(e, trace_id))?;

        let Some(user) = user else {
            uow.rollback().await.map_err(|e| map_anyhow(e, trace_id))?;
            return Err(invalid_credentials(trace_id));
        };

        if let Some(locked_until) = user.locked_until {
            if locked_until > Utc::now() {
                uow.rollback().await.map_err(|e| map_anyhow(e, trace_id))?;
                let retry_after = (locked_until - Utc::now()).num_seconds().max(1);
                return Err(ApiError::Locked { retry_after, trace_id });
            }
        }

        let password_ok = self.verify_password_blocking(&req.password, &user.password_hash).await;
        if !user.is_active || !password_ok {
            self.record_login_failure(&mut uow, &user, trace_id).await?;
            uow.commit().await.map_err(|e| map_anyhow(e, trace_id))?;
            return Err(invalid_credentials(trace_id));
        }

        if user.mfa_enabled {
            let secret = user.mfa_secret.clone().ok_or_else(|| {
                ApiError::internal(anyhow::anyhow!("mfa_enabled with no secret"), trace_id)
            })?;

            let Some(raw_code) = req.mfa_code.as_deref() else {
                uow.rollback().await.map_err(|e| map_anyhow(e, trace_id))?;
                return Err(ApiError::MfaRequired { trace_id });
            };

            if let Some(code) = crate::mfa::normalize_mfa_code(raw_code) {
                match self
                    .mfa
                    .verify(&secret, &code, &user.id.to_string())
                    .await
                    .map_err(|e| map_anyhow(e, trace_id))?
                {
                    MfaVerifyOutcome::Valid => {}
                    MfaVerifyOutcome::InvalidCode { .. } => {
                        self.record_login_failure(&mut uow, &user, trace_id).await?;
                        uow.commit().await.map_err(|e| map_anyhow(e, trace_id))?;
                        return Err(invalid_credentials(trace_id));
                    }
                    MfaVerifyOutcome::LockedOut => {
                        uow.rollback().await.map_err(|e| map_anyhow(e, trace_id))?;
                        return Err(ApiError::Locked {
                            retry_after: self.config.login_lockout_seconds as i64,
                            trace_id,
                        });
                    }
                }
            } else {
                // Not a 6-digit TOTP code: spec §4.4 allows a recovery code as a
                // one-time MFA substitute. Consumption happens in this same UoW
                // so a code can't be replayed across two concurrent logins.
                let hash = MFAEngine::hash_recovery_code(raw_code, &self.config.pepper);
                let consumed = self
                    .users
                    .consume_recovery_code(uow.conn(), user.id, &hash)
                    .await
                    .map_err(|e| map_repo_error(e, trace_id))?;
                if !consumed {
                    self.record_login_failure(&mut uow, &user, trace_id).await?;
                    uow.commit().await.map_err(|e| map_anyhow(e, trace_id))?;
                    return Err(invalid_credentials(trace_id));
                }
            }
        }

        self.users
            .reset_failure_counters(uow.conn(), user.id)
            .await
            .map_err(|e| map_repo_error(e, trace_id))?;
        let role_ids = self
            .users
            .role_ids_for(uow.conn(), user.id)
            .await
            .map_err(|e| map_repo_error(e, trace_id))?;

        let session_expires_at = Utc::now() + Duration::seconds(self.tokens.refresh_ttl_seconds());
        self.sessions
            .create(uow.conn(), user.id, None, None, session_expires_at)
            .await
            .map_err(|e| map_repo_error(e, trace_id))?;

        uow.commit().await.map_err(|e| map_anyhow(e, trace_id))?;

        let tokens = self
            .tokens
            .issue(TokenSubject {
                user_id: user.id,
                tenant_id: user.tenant_id,
                roles: role_ids.iter().map(|id| id.to_string()).collect(),
            })
            .await
            .map_err(|e| map_anyhow(e, trace_id))?;

        Ok(LoginOutcome { tokens, user_id: user.id })
    }

    /// Mirrors `AdminCoordinator::hash_password_blocking` — argon2id verification
    /// is as CPU-heavy as hashing, so it must not run inline on the async
    /// executor either. A join failure (panic in the blocking task) is treated
    /// as a failed verification rather than propagated, matching `verify`'s own
    /// infallible `bool` signature.
    async fn verify_password_blocking(&self, plaintext: &str, stored: &str) -> bool {
        let vault = self.passwords.clone();
        let plaintext = plaintext.to_string();
        let stored = stored.to_string();
        tokio::task::spawn_blocking(move || vault.verify(&plaintext, &stored))
            .await
            .unwrap_or(false)
    }

    async fn record_login_failure(
        &self,
        uow: &mut UnitOfWork<'_>,
        user: &UserRecord,
        trace_id: Option<Uuid>,
    ) -> Result<(), ApiError> {
        let lock_until = Some(Utc::now() + Duration::seconds(self.config.login_lockout_seconds as i64));
        let attempts = self
            .users
            .record_login_failure(
                uow.conn(),
                user.id,
                if (user.failed_attempts + 1) >= self.config.login_attempt_limit as i32 {
                    lock_until
                } else {
                    None
                },
            )
            .await
            .map_err(|e| map_repo_error(e, trace_id))?;
        let _ = attempts;
        Ok(())
    }

    /// Refresh flow from spec §4.9/§4.2: single-use refresh token, reuse of an
    /// already-consumed token revokes the subject's entire refresh-token set.
    pub async fn refresh(&self, refresh_token: &str, trace_id: Uuid) -> Result<LoginOutcome, ApiError> {
        let trace_id = Some(trace_id);
        let subject = self
            .tokens
            .consume_refresh_token(refresh_token)
            .await
            .map_err(|e| map_anyhow(e, trace_id))?
            .ok_or(ApiError::Unauthorized { code: "token_revoked", trace_id })?;

        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, trace_id))?;
        let role_ids = self
            .users
            .role_ids_for(uow.conn(), subject.user_id)
            .await
            .map_err(|e| map_repo_error(e, trace_id))?;
        uow.commit().await.map_err(|e| map_anyhow(e, trace_id))?;

        let tokens = self
            .tokens
            .issue(TokenSubject {
                user_id: subject.user_id,
                tenant_id: subject.tenant_id,
                roles: role_ids.iter().map(|id| id.to_string()).collect(),
            })
            .await
            .map_err(|e| map_anyhow(e, trace_id))?;

        Ok(LoginOutcome { tokens, user_id: subject.user_id })
    }

    /// Revokes the caller's access-token JTI, consumes (revokes) the refresh
    /// token, and clears the subject's `active_sessions` rows, per spec §4.9's
    /// logout use case. `jti` and `user_id` must come from a verified
    /// `AuthContext` (the handler's job) — this coordinator never decodes a
    /// token itself, so there is no path for an unverified bearer token to
    /// reach the denylist or a session wipe.
    pub async fn logout(&self, jti: &str, user_id: Uuid, refresh_token: Option<&str>, trace_id: Uuid) -> Result<(), ApiError> {
        let trace_id = Some(trace_id);
        self.tokens.deny_access_jti(jti).await.map_err(|e| map_anyhow(e, trace_id))?;

        if let Some(refresh) = refresh_token {
            // Consuming marks it used; a logged-out refresh token is never valid again.
            let _ = self.tokens.consume_refresh_token(refresh).await;
        }

        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, trace_id))?;
        for session in self
            .sessions
            .list_for_user(uow.conn(), user_id)
            .await
            .map_err(|e| map_repo_error(e, trace_id))?
        {
            self.sessions
                .delete(uow.conn(), session.id)
                .await
                .map_err(|e| map_repo_error(e, trace_id))?;
        }
        uow.commit().await.map_err(|e| map_anyhow(e, trace_id))?;
        Ok(())
    }

    /// `POST /auth/mfa/setup` — generates a fresh secret; nothing is persisted
    /// until `confirm_mfa_enrollment` verifies a code against it, so an
    /// abandoned setup leaves no trace in the database.
    pub fn begin_mfa_enrollment(&self, issuer: &str, account_label: &str) -> (String, String) {
        let secret = self.mfa.generate_secret();
        let uri = self.mfa.provisioning_uri(issuer, account_label, &secret);
        (secret, uri)
    }

    /// `POST /auth/mfa/verify` — confirms the client-held secret, then persists
    /// it as the active MFA secret plus a freshly generated, hashed set of
    /// recovery codes (returned once, spec §4.4) in one UoW.
    pub async fn confirm_mfa_enrollment(
        &self,
        user_id: Uuid,
        pending_secret: &str,
        code: &str,
        trace_id: Uuid,
    ) -> Result<Vec<String>, ApiError> {
        let trace_id = Some(trace_id);
        let normalized = crate::mfa::normalize_mfa_code(code)
            .ok_or(ApiError::Unauthorized { code: "invalid_mfa_code", trace_id })?;

        match self
            .mfa
            .verify(pending_secret, &normalized, &user_id.to_string())
            .await
            .map_err(|e| map_anyhow(e, trace_id))?
        {
            MfaVerifyOutcome::Valid => {}
            MfaVerifyOutcome::InvalidCode { .. } => {
                return Err(ApiError::Unauthorized { code: "invalid_mfa_code", trace_id });
            }
            MfaVerifyOutcome::LockedOut => {
                return Err(ApiError::Locked { retry_after: self.config.login_lockout_seconds as i64, trace_id });
            }
        }

        let recovery_codes = self.mfa.generate_recovery_codes();
        let hashed: Vec<String> = recovery_codes
            .iter()
            .map(|code| MFAEngine::hash_recovery_code(code, &self.config.pepper))
            .collect();

        let mut uow = UnitOfWork::begin(&self.pool).await.map_err(|e| map_anyhow(e, trace_id))?;
        self.users
            .set_mfa_secret(uow.conn(), user_id, Some(pending_secret))
            .await
            .map_err(|e| map_repo_error(e, trace_id))?;
        self.users
            .set_mfa_enabled(uow.conn(), user_id, true)
            .await
            .map_err(|e| map_repo_error(e, trace_id))?;
        self.users
            .replace_recovery_codes(uow.conn(), user_id, &hashed)
            .await
            .map_err(|e| map_repo_error(e, trace_id))?;
        uow.commit().await.map_err(|e| map_anyhow(e, trace_id))?;
        Ok(recovery_codes)
    }

    pub fn cache(&self) -> &FastCache {
        &self.cache
    }
}

fn invalid_credentials(trace_id: Option<Uuid>) -> ApiError {
    ApiError::Unauthorized { code: "invalid_credentials", trace_id }
}
