//! HTTP routes

pub mod admin;
pub mod auth;
pub mod checkout;
pub mod health;
pub mod results;
pub mod webhooks;


use axum::{
    http::HeaderMap,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Router,
};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

/// Build the full router.
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let public = Router::new()
        .route("/health", get(health::health))
        .route("/api/v1/auth/login", post(auth::login))
        .route("/api/v1/checkout/stripe", post(checkout::create_stripe_checkout))
        .route("/api/v1/checkout/sipay", post(checkout::create_sipay_checkout))
        .route("/api/v1/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/api/v1/webhooks/fastspring", post(webhooks::fastspring_webhook))
        .route("/api/v1/webhooks/sipay", post(webhooks::sipay_webhook));

    let authenticated = Router::new()
        .route("/api/v1/me", get(auth::me))
        .route("/api/v1/me/cancel", post(auth::cancel_own_subscription))
        .route(
            "/api/v1/results",
            get(results::list_results).post(results::create_result),
        )
        .route("/api/v1/results/{id}", get(results::get_result))
        .route_layer(from_fn_with_state(auth_state.clone(), require_auth));

    let admin = Router::new()
        .route("/api/v1/admin/users", get(admin::list_users))
        .route("/api/v1/admin/users/{id}", get(admin::get_user))
        .route("/api/v1/admin/users/{id}/refund", post(admin::refund_user))
        .route("/api/v1/admin/users/{id}/cancel", post(admin::cancel_user))
        .route("/api/v1/admin/config", get(admin::list_config))
        .route(
            "/api/v1/admin/config/{key}",
            put(admin::set_config).delete(admin::delete_config),
        )
        .route("/api/v1/admin/webhooks", get(admin::list_webhooks))
        .route("/api/v1/admin/webhooks/{id}/replay", post(admin::replay_webhook))
        .route(
            "/api/v1/admin/webhooks/replay-failed",
            post(admin::replay_failed_webhooks),
        )
        .route("/api/v1/admin/billing/invariants", get(admin::run_invariants))
        .route_layer(from_fn(require_admin))
        .route_layer(from_fn_with_state(auth_state, require_auth));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .merge(admin)
        .with_state(state)
}

/// Client IP from proxy headers, first hop of `X-Forwarded-For` preferred.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first) = xff.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return Some(first.to_string());
        }
    }
    ["cf-connecting-ip", "x-real-ip"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|h| h.to_str().ok()))
        .map(|ip| ip.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers), None);
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("198.51.100.2"));
    }
}
