//! Runtime key/value configuration
//!
//! Vendor credentials and trial parameters live in the `site_config` table so
//! they can be rotated from the admin API without a redeploy. Every lookup
//! falls back to an environment variable so a fresh database still boots.

use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SharedError, SharedResult};

/// Well-known keys and their environment fallbacks.
pub mod config_keys {
    pub const TRIAL_DAYS: &str = "trial_days";
    pub const TRIAL_FEE_CENTS: &str = "trial_fee_cents";
    pub const CURRENCY: &str = "currency";
    pub const SIPAY_BASE_URL: &str = "sipay.base_url";
    pub const SIPAY_MERCHANT_KEY: &str = "sipay.merchant_key";
    pub const SIPAY_APP_SECRET: &str = "sipay.app_secret";
    pub const SIPAY_RECURRING_PLAN: &str = "sipay.recurring_plan";
    pub const FASTSPRING_BASE_URL: &str = "fastspring.base_url";
    pub const FASTSPRING_API_USER: &str = "fastspring.api_user";
    pub const FASTSPRING_API_PASSWORD: &str = "fastspring.api_password";
    pub const FASTSPRING_WEBHOOK_SECRET: &str = "fastspring.webhook_secret";

    /// Map a config key to its environment variable (`sipay.app_secret` -> `SIPAY_APP_SECRET`).
    pub fn env_var_for(key: &str) -> String {
        key.replace('.', "_").to_ascii_uppercase()
    }

    /// Values under these keys are never returned in plain text.
    pub fn is_secret(key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        ["secret", "password", "key", "token"]
            .iter()
            .any(|needle| key.contains(needle))
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SiteConfigEntry {
    pub key: String,
    pub value: String,
    pub updated_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SiteConfigEntry {
    /// Copy suitable for API responses, with secret values masked.
    pub fn redacted(&self) -> SiteConfigEntry {
        let mut entry = self.clone();
        if config_keys::is_secret(&entry.key) {
            entry.value = mask(&entry.value);
        }
        entry
    }
}

fn mask(value: &str) -> String {
    let tail: String = value
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if value.chars().count() <= 8 {
        "[REDACTED]".to_string()
    } else {
        format!("[REDACTED]...{tail}")
    }
}

#[derive(Clone)]
pub struct SiteConfigStore {
    pool: PgPool,
}

impl SiteConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> SharedResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM site_config WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Table value first, then the matching environment variable.
    pub async fn get_or_env(&self, key: &str) -> SharedResult<Option<String>> {
        if let Some(value) = self.get(key).await? {
            if !value.is_empty() {
                return Ok(Some(value));
            }
        }
        Ok(std::env::var(config_keys::env_var_for(key))
            .ok()
            .filter(|v| !v.is_empty()))
    }

    /// Parsed lookup. An unparsable stored value is an error, not a silent default.
    pub async fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> SharedResult<Option<T>> {
        match self.get_or_env(key).await? {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| SharedError::InvalidConfigValue {
                    key: key.to_string(),
                    value: raw,
                }),
            None => Ok(None),
        }
    }

    pub async fn trial_days(&self, default: u32) -> SharedResult<u32> {
        Ok(self
            .get_parsed::<u32>(config_keys::TRIAL_DAYS)
            .await?
            .unwrap_or(default))
    }

    pub async fn list(&self) -> SharedResult<Vec<SiteConfigEntry>> {
        let rows = sqlx::query_as::<_, SiteConfigEntry>(
            "SELECT key, value, updated_by, updated_at FROM site_config ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set(&self, key: &str, value: &str, updated_by: Uuid) -> SharedResult<SiteConfigEntry> {
        validate_key(key)?;
        validate_value(key, value)?;

        let entry = sqlx::query_as::<_, SiteConfigEntry>(
            r#"
            INSERT INTO site_config (key, value, updated_by, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                updated_by = EXCLUDED.updated_by,
                updated_at = NOW()
            RETURNING key, value, updated_by, updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(updated_by)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(key = %key, updated_by = %updated_by, "Site config updated");
        Ok(entry)
    }

    pub async fn delete(&self, key: &str) -> SharedResult<bool> {
        let result = sqlx::query("DELETE FROM site_config WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn validate_key(key: &str) -> SharedResult<()> {
    let valid = !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(SharedError::Validation(format!("invalid config key '{key}'")))
    }
}

/// Numeric keys are checked on write so a typo cannot break checkout later.
fn validate_value(key: &str, value: &str) -> SharedResult<()> {
    let numeric = matches!(key, config_keys::TRIAL_DAYS | config_keys::TRIAL_FEE_CENTS);
    if numeric && value.trim().parse::<u32>().is_err() {
        return Err(SharedError::InvalidConfigValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}
