use anyhow::{anyhow, Context, Result};
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieSameSite {
    Lax,
    Strict,
    None,
}

impl CookieSameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            CookieSameSite::Lax => "Lax",
            CookieSameSite::Strict => "Strict",
            CookieSameSite::None => "None",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mfa_issuer: String,
    pub mfa_activity_topic: String,
    pub suspicious_webhook_url: Option<String>,
    pub suspicious_webhook_bearer: Option<String>,
    pub refresh_cookie_name: String,
    pub refresh_cookie_domain: Option<String>,
    pub refresh_cookie_secure: bool,
    pub refresh_cookie_same_site: CookieSameSite,

    /// Pepper mixed into password and recovery-code hashes (spec §4.3), kept out
    /// of the database entirely and rotated only by redeploying every hash.
    pub pepper: String,
    pub password_hash_cost: crate::password::HashCost,

    /// Login lockout (spec §4.9's state machine): attempts before the account
    /// locks, and how long the lock lasts.
    pub login_attempt_limit: i64,
    pub login_lockout_seconds: u64,

    /// MFA verification window and attempt budget (spec §4.4).
    pub mfa_window_steps: i32,
    pub mfa_attempt_limit: i64,

    /// Signing-key rotation cadence and grace window (spec §4.1).
    pub key_rotation_interval_days: i64,
    pub key_grace_days: i64,

    /// Redis URL for `FastCache`; `None` falls back to the non-durable
    /// in-process cache (spec §9).
    pub cache_url: Option<String>,
}

pub fn load_auth_config() -> Result<AuthConfig> {
    let mfa_issuer = env::var("AUTH_MFA_ISSUER").unwrap_or_else(|_| "auth-service".to_string());

    let mfa_activity_topic = env::var("SECURITY_MFA_ACTIVITY_TOPIC")
        .unwrap_or_else(|_| "security.mfa.activity".to_string());

    let suspicious_webhook_url = env::var("SECURITY_SUSPICIOUS_WEBHOOK_URL")
        .ok()
        .and_then(|value| normalize_optional(&value));
    let suspicious_webhook_bearer = env::var("SECURITY_SUSPICIOUS_WEBHOOK_BEARER")
        .ok()
        .and_then(|value| normalize_optional(&value));

    let refresh_cookie_name =
        env::var("AUTH_REFRESH_COOKIE_NAME").unwrap_or_else(|_| "auth_refresh".to_string());
    let refresh_cookie_domain = env::var("AUTH_REFRESH_COOKIE_DOMAIN")
        .ok()
        .and_then(|value| normalize_optional(&value));
    let refresh_cookie_secure = bool_from_env("AUTH_REFRESH_COOKIE_SECURE").unwrap_or(false);
    let refresh_cookie_same_site = env::var("AUTH_REFRESH_COOKIE_SAMESITE")
        .ok()
        .map(|value| parse_same_site(&value))
        .transpose()
        .context("Failed to parse AUTH_REFRESH_COOKIE_SAMESITE")?
        .unwrap_or(CookieSameSite::Lax);

    let pepper = match env::var("PEPPER") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => {
            let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
            if environment.eq_ignore_ascii_case("prod") {
                return Err(anyhow!(
                    "PEPPER must be set when ENVIRONMENT=prod (missing pepper is fatal, matching hasher.py's MISSING_PEPPER)"
                ));
            }
            warn_default_pepper();
            "insecure-dev-pepper-change-me".to_string()
        }
    };

    let password_hash_cost = crate::password::HashCost {
        m_cost: env_u32("PASSWORD_HASH_M_COST").unwrap_or(19_456),
        t_cost: env_u32("PASSWORD_HASH_T_COST").unwrap_or(2),
        p_cost: env_u32("PASSWORD_HASH_P_COST").unwrap_or(1),
    };

    let login_attempt_limit = env_i64("LOGIN_ATTEMPT_LIMIT").unwrap_or(5);
    let login_lockout_seconds = env_u64("LOGIN_LOCKOUT_SECONDS").unwrap_or(900);
    let mfa_window_steps = env_u32("MFA_WINDOW_STEPS").map(|v| v as i32).unwrap_or(1);
    let mfa_attempt_limit = env_i64("MFA_ATTEMPT_LIMIT").unwrap_or(5);
    let key_rotation_interval_days = env_i64("KEY_ROTATION_INTERVAL_DAYS").unwrap_or(90);
    let key_grace_days = env_i64("KEY_GRACE_DAYS").unwrap_or(7);
    let cache_url = env::var("CACHE_URL").ok().and_then(|value| normalize_optional(&value));

    Ok(AuthConfig {
        mfa_issuer,
        mfa_activity_topic,
        suspicious_webhook_url,
        suspicious_webhook_bearer,
        refresh_cookie_name,
        refresh_cookie_domain,
        refresh_cookie_secure,
        refresh_cookie_same_site,
        pepper,
        password_hash_cost,
        login_attempt_limit,
        login_lockout_seconds,
        mfa_window_steps,
        mfa_attempt_limit,
        key_rotation_interval_days,
        key_grace_days,
        cache_url,
    })
}

fn warn_default_pepper() {
    tracing::warn!("PEPPER not set; using an insecure default. Set PEPPER in every non-dev environment.");
}

fn env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn bool_from_env(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn normalize_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_same_site(value: &str) -> Result<CookieSameSite> {
    match value.trim().to_ascii_lowercase().as_str() {
        "lax" => Ok(CookieSameSite::Lax),
        "strict" => Ok(CookieSameSite::Strict),
        "none" => Ok(CookieSameSite::None),
        other => Err(anyhow!(
            "Unsupported cookie same-site policy '{other}'. Use Lax, Strict, or None."
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_from_env_parses() {
        std::env::set_var("TEST_BOOL_TRUE", "true");
        std::env::set_var("TEST_BOOL_ONE", "1");
        std::env::set_var("TEST_BOOL_FALSE", "no");
        assert_eq!(bool_from_env("TEST_BOOL_TRUE"), Some(true));
        assert_eq!(bool_from_env("TEST_BOOL_ONE"), Some(true));
        assert_eq!(bool_from_env("TEST_BOOL_FALSE"), Some(false));
    }

    #[test]
    fn parse_same_site_accepts_known_values_and_rejects_others() {
        assert!(matches!(parse_same_site("Lax").unwrap(), CookieSameSite::Lax));
        assert!(matches!(parse_same_site("STRICT").unwrap(), CookieSameSite::Strict));
        assert!(matches!(parse_same_site("none").unwrap(), CookieSameSite::None));
        assert!(parse_same_site("bogus").is_err());
    }

    // Env-var mutation makes these races under `cargo test`'s default thread
    // pool; run serially via a shared lock so neither test observes the
    // other's ENVIRONMENT/PEPPER values.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn missing_pepper_is_fatal_in_prod() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("PEPPER");
        env::set_var("ENVIRONMENT", "prod");
        assert!(load_auth_config().is_err());
        env::remove_var("ENVIRONMENT");
    }

    #[test]
    fn missing_pepper_falls_back_to_a_dev_default_outside_prod() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("PEPPER");
        env::remove_var("ENVIRONMENT");
        let config = load_auth_config().expect("dev config without PEPPER must still load");
        assert_eq!(config.pepper, "insecure-dev-pepper-change-me");
    }
}
