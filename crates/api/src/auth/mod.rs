//! Authentication for the MindScore API

#[cfg(test)]
mod edge_case_tests;
pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{require_admin, require_auth, AuthError, AuthState, AuthUser, AUTH_COOKIE};
