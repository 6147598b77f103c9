// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries vendor messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! MindScore API Library
//!
//! HTTP surface for the quiz funnel: login, questionnaire results gated on
//! the subscription, checkout, vendor webhooks and the admin console.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
