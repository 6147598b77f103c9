//! API server configuration loaded from the environment

use std::env;

use thiserror::Error;

/// Minimum length accepted for `JWT_SECRET`.
pub const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations when set.
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Public site origin used for checkout return URLs.
    pub public_url: String,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: format!("must be at least {MIN_JWT_SECRET_LEN} characters"),
            });
        }

        let jwt_expiry_hours = match env::var("JWT_EXPIRY_HOURS") {
            Ok(raw) => raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|h| *h > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "JWT_EXPIRY_HOURS",
                    reason: format!("'{raw}' is not a positive integer"),
                })?,
            Err(_) => 24 * 7,
        };

        let allowed_origins = parse_origins(
            &env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string()),
        );

        Ok(Self {
            database_url,
            database_direct_url: env::var("DATABASE_DIRECT_URL").ok().filter(|v| !v.is_empty()),
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            jwt_secret,
            jwt_expiry_hours,
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            allowed_origins,
            run_migrations: env::var("RUN_MIGRATIONS")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(true),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches('/').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SECRET: &str = "test-jwt-secret-key-at-least-32-characters";

    fn clear() {
        for name in [
            "DATABASE_URL",
            "DATABASE_DIRECT_URL",
            "JWT_SECRET",
            "JWT_EXPIRY_HOURS",
            "BIND_ADDRESS",
            "ALLOWED_ORIGINS",
            "RUN_MIGRATIONS",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        clear();
        env::set_var("JWT_SECRET", SECRET);
        assert!(matches!(Config::from_env(), Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    #[serial]
    fn test_short_jwt_secret_rejected() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/mindscore");
        env::set_var("JWT_SECRET", "short");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { name: "JWT_SECRET", .. })
        ));
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/mindscore");
        env::set_var("JWT_SECRET", SECRET);
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.jwt_expiry_hours, 168);
        assert!(config.run_migrations);
        assert_eq!(config.allowed_origins.len(), 2);
        assert!(config.database_direct_url.is_none());
    }

    #[test]
    #[serial]
    fn test_invalid_expiry() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/mindscore");
        env::set_var("JWT_SECRET", SECRET);
        env::set_var("JWT_EXPIRY_HOURS", "0");
        assert!(Config::from_env().is_err());
        clear();
    }

    #[test]
    fn test_origins_are_trimmed() {
        assert_eq!(
            parse_origins(" https://mindscore.app/ ,, https://www.mindscore.app"),
            vec!["https://mindscore.app", "https://www.mindscore.app"]
        );
    }
}
