//! Errors raised by the shared crate

use thiserror::Error;

pub type SharedResult<T> = Result<T, SharedError>;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Password hashing failed: {0}")]
    PasswordHash(String),

    #[error("Invalid value for config key {key}: {value}")]
    InvalidConfigValue { key: String, value: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
