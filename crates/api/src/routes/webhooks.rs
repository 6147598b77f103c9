//! Vendor webhook endpoints
//!
//! Status codes drive vendor retries: 401 bad signature, 400 malformed
//! body, 500 processing failure, 200 for processed, duplicate and ignored
//! events.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use mindscore_billing::{fastspring::acknowledgement_body, WebhookReport};
use mindscore_shared::PaymentProvider;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const FASTSPRING_SIGNATURE_HEADER: &str = "x-fs-signature";
pub const SIPAY_SIGNATURE_HEADER: &str = "x-sipay-signature";

fn signature<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn receive(
    state: &AppState,
    provider: PaymentProvider,
    headers: &HeaderMap,
    header_name: &str,
    body: &Bytes,
) -> ApiResult<WebhookReport> {
    let report = state
        .billing
        .webhooks
        .handle(provider, body, signature(headers, header_name))
        .await
        .map_err(|e| {
            tracing::warn!(provider = %provider, error = %e, "Webhook rejected");
            ApiError::from(e)
        })?;

    tracing::info!(
        provider = %provider,
        acknowledged = report.acknowledged.len(),
        failed = report.failed.len(),
        "Webhook delivery handled"
    );
    Ok(report)
}

/// Single-event vendors: any processing failure is a 500 so the vendor retries.
fn single_event_response(report: WebhookReport) -> Response {
    if report.all_succeeded() {
        (StatusCode::OK, Json(json!({ "received": true }))).into_response()
    } else {
        let errors: Vec<&str> = report.failed.iter().map(|f| f.error.as_str()).collect();
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Webhook processing failed",
                "code": 500,
                "details": errors,
            })),
        )
            .into_response()
    }
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let report = receive(
        &state,
        PaymentProvider::Stripe,
        &headers,
        STRIPE_SIGNATURE_HEADER,
        &body,
    )
    .await?;
    Ok(single_event_response(report))
}

pub async fn sipay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let report = receive(
        &state,
        PaymentProvider::Sipay,
        &headers,
        SIPAY_SIGNATURE_HEADER,
        &body,
    )
    .await?;
    Ok(single_event_response(report))
}

/// FastSpring batches events and redelivers any id missing from the
/// plain-text response body, so partial failure still answers 200.
pub async fn fastspring_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let report = receive(
        &state,
        PaymentProvider::FastSpring,
        &headers,
        FASTSPRING_SIGNATURE_HEADER,
        &body,
    )
    .await?;

    if !report.all_succeeded() && report.acknowledged.is_empty() {
        tracing::error!(failed = report.failed.len(), "No FastSpring event in batch processed");
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        acknowledgement_body(&report.acknowledged),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindscore_billing::webhooks::EventFailure;

    fn report(acknowledged: &[&str], failed: &[&str]) -> WebhookReport {
        WebhookReport {
            provider: PaymentProvider::Stripe,
            acknowledged: acknowledged.iter().map(|s| s.to_string()).collect(),
            failed: failed
                .iter()
                .map(|id| EventFailure {
                    event_id: id.to_string(),
                    error: "boom".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_single_event_success_is_ok() {
        assert_eq!(single_event_response(report(&["evt_1"], &[])).status(), StatusCode::OK);
    }

    #[test]
    fn test_single_event_failure_is_server_error() {
        assert_eq!(
            single_event_response(report(&[], &["evt_1"])).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_signature_header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("X-FS-Signature", "abc=".parse().unwrap());
        assert_eq!(signature(&headers, FASTSPRING_SIGNATURE_HEADER), Some("abc="));
        assert_eq!(signature(&headers, STRIPE_SIGNATURE_HEADER), None);
    }
}
