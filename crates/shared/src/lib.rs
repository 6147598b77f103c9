#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Mindscore shared types
//!
//! Data model, database pool helpers and the runtime site configuration
//! store used by the API server, the billing crate and the worker.

pub mod db;
pub mod error;
pub mod models;
pub mod password;
pub mod site_config;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use error::{SharedError, SharedResult};
pub use models::{
    NewTestResult, PaymentProvider, SubscriptionStatus, TestKind, TestResult, TransitionTrigger,
    User, UserRole,
};
pub use password::{generate_password, hash_password, verify_login};
pub use site_config::{config_keys, SiteConfigEntry, SiteConfigStore};
