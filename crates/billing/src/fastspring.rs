//! FastSpring webhooks and REST client
//!
//! Deliveries are batched: one POST carries an `events` array and FastSpring
//! expects the ids it may stop retrying back in the response body, one per
//! line. Amounts arrive as decimal major units.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use mindscore_shared::{config_keys, PaymentProvider, SiteConfigStore};

use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{PaymentEvent, VendorEvent};
use crate::provisioning::CheckoutDetails;
use crate::webhooks::{EventFailure, IncomingEvent, ParsedDelivery, WebhookParser};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_FASTSPRING_API_URL: &str = "https://api.fastspring.com";

// ============================================================================
// Webhooks
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    /// Milliseconds since epoch.
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    data: Value,
}

pub struct FastSpringWebhookParser {
    webhook_secret: String,
}

impl FastSpringWebhookParser {
    pub fn new(webhook_secret: String) -> Self {
        Self { webhook_secret }
    }
}

/// `X-FS-Signature`: base64 HMAC-SHA256 of the raw body.
pub fn sign_payload(secret: &str, payload: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::MissingConfig("fastspring webhook secret".into()))?;
    mac.update(payload);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

impl WebhookParser for FastSpringWebhookParser {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::FastSpring
    }

    fn verify(&self, payload: &[u8], signature: &str) -> BillingResult<()> {
        let expected = sign_payload(&self.webhook_secret, payload)?;
        let provided = signature.trim();

        if expected.len() == provided.len()
            && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
        {
            Ok(())
        } else {
            tracing::warn!("FastSpring signature mismatch");
            Err(BillingError::WebhookSignatureInvalid)
        }
    }

    fn parse(&self, payload: &[u8]) -> BillingResult<ParsedDelivery> {
        let envelope: Envelope = serde_json::from_slice(payload)?;
        let mut delivery = ParsedDelivery::default();

        for raw in envelope.events {
            match self.parse_stored(&raw) {
                Ok(event) => delivery.events.push(IncomingEvent { raw, event }),
                Err(e) => delivery.rejected.push(EventFailure {
                    event_id: raw
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    error: e.to_string(),
                }),
            }
        }

        Ok(delivery)
    }

    fn parse_stored(&self, raw: &Value) -> BillingResult<VendorEvent> {
        let event: RawEvent = serde_json::from_value(raw.clone())?;
        Ok(map_event(event))
    }
}

fn map_event(raw: RawEvent) -> VendorEvent {
    let data = &raw.data;
    let payment_event = match raw.event_type.as_str() {
        "order.completed" => {
            let tags = data.get("tags");
            let customer = data.get("customer");
            let user_name = tag(tags, "user_name").or_else(|| {
                customer
                    .and_then(|c| c.get("first"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

            PaymentEvent::CheckoutCompleted(CheckoutDetails {
                email: customer
                    .and_then(|c| c.get("email"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                user_name,
                iq: tag(tags, "iq").and_then(|v| v.parse().ok()),
                subscription_id: data
                    .get("items")
                    .and_then(Value::as_array)
                    .and_then(|items| items.iter().find_map(|i| i.get("subscription").and_then(id_of))),
                customer_ref: data.get("account").and_then(id_of),
                trial_end: None,
                amount_cents: data.get("total").and_then(to_cents),
                currency: data.get("currency").and_then(Value::as_str).map(str::to_string),
            })
        }
        "subscription.activated" => match data.get("id").and_then(id_of) {
            Some(subscription_id) => {
                let trial_end = if data.get("state").and_then(Value::as_str) == Some("trial") {
                    next_charge(data)
                } else {
                    None
                };
                PaymentEvent::SubscriptionActivated {
                    subscription_id,
                    trial_end,
                }
            }
            None => ignored(&raw.event_type),
        },
        "subscription.charge.completed" => match data.get("subscription").and_then(id_of) {
            Some(subscription_id) => PaymentEvent::RenewalPaid {
                subscription_id,
                amount_cents: data.get("total").and_then(to_cents),
            },
            None => ignored(&raw.event_type),
        },
        "subscription.charge.failed" => match data.get("subscription").and_then(id_of) {
            Some(subscription_id) => PaymentEvent::PaymentFailed {
                subscription_id,
                reason: data.get("reason").and_then(Value::as_str).map(str::to_string),
            },
            None => ignored(&raw.event_type),
        },
        // `canceled` with a next charge date runs to period end; access ends
        // on `deactivated`.
        "subscription.canceled" => match (data.get("id").and_then(id_of), next_charge(data)) {
            (Some(subscription_id), None) => PaymentEvent::SubscriptionCanceled { subscription_id },
            _ => ignored(&raw.event_type),
        },
        "subscription.deactivated" => match data.get("id").and_then(id_of) {
            Some(subscription_id) => PaymentEvent::SubscriptionCanceled { subscription_id },
            None => ignored(&raw.event_type),
        },
        "subscription.trial.reminder" => match data.get("id").and_then(id_of) {
            Some(subscription_id) => PaymentEvent::TrialEnding {
                subscription_id,
                trial_end: next_charge(data),
            },
            None => ignored(&raw.event_type),
        },
        "return.created" => {
            let original = data.get("original");
            PaymentEvent::Refunded {
                subscription_id: original
                    .and_then(|o| o.get("subscriptions"))
                    .and_then(Value::as_array)
                    .and_then(|subs| subs.first())
                    .and_then(id_of),
                customer_ref: data.get("account").and_then(id_of),
                amount_cents: data.get("totalReturn").and_then(to_cents),
            }
        }
        _ => ignored(&raw.event_type),
    };

    VendorEvent {
        provider: PaymentProvider::FastSpring,
        event_id: raw.id,
        event_type: raw.event_type,
        occurred_at: raw.created.map_or_else(OffsetDateTime::now_utc, from_millis),
        event: payment_event,
    }
}

fn ignored(event_type: &str) -> PaymentEvent {
    PaymentEvent::Ignored {
        event_type: event_type.to_string(),
    }
}

/// FastSpring expands references inconsistently: a bare id or an object with `id`.
fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn tag(tags: Option<&Value>, name: &str) -> Option<String> {
    match tags?.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 29.99 -> 2999
fn to_cents(value: &Value) -> Option<i64> {
    value.as_f64().map(|v| (v * 100.0).round() as i64)
}

fn next_charge(data: &Value) -> Option<OffsetDateTime> {
    data.get("nextChargeDate")
        .or_else(|| data.get("next"))
        .and_then(Value::as_i64)
        .map(from_millis)
}

fn from_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
}

// ============================================================================
// REST client
// ============================================================================

#[derive(Debug, Deserialize)]
struct SubscriptionActionResponse {
    subscriptions: Vec<SubscriptionActionResult>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionActionResult {
    result: String,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionDetails {
    #[serde(default)]
    initial_order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderDetails {
    id: String,
    #[serde(default)]
    total: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
}

/// The parts of an order needed to refund it.
#[derive(Debug, Clone, PartialEq)]
pub struct FastSpringOrder {
    pub order_id: String,
    pub amount_cents: i64,
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReturnsResponse {
    returns: Vec<ReturnResult>,
}

#[derive(Debug, Deserialize)]
struct ReturnResult {
    #[serde(rename = "return")]
    return_id: Option<String>,
    result: String,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Clone)]
pub struct FastSpringClient {
    http: Client,
    base_url: String,
    api_user: String,
    api_password: String,
}

impl FastSpringClient {
    pub fn new(base_url: impl Into<String>, api_user: String, api_password: String) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_user,
            api_password,
        }
    }

    /// Credentials from site config, falling back to `FASTSPRING_*` env vars.
    pub async fn from_site_config(store: &SiteConfigStore) -> BillingResult<Self> {
        let user = store
            .get_or_env(config_keys::FASTSPRING_API_USER)
            .await?
            .ok_or_else(|| BillingError::ProviderNotConfigured("fastspring api user".into()))?;
        let password = store
            .get_or_env(config_keys::FASTSPRING_API_PASSWORD)
            .await?
            .ok_or_else(|| BillingError::ProviderNotConfigured("fastspring api password".into()))?;
        let base_url = store
            .get_or_env(config_keys::FASTSPRING_BASE_URL)
            .await?
            .unwrap_or_else(|| DEFAULT_FASTSPRING_API_URL.to_string());
        Ok(Self::new(base_url, user, password))
    }

    /// Cancel a subscription. Without `immediate` it runs to the end of the
    /// paid period.
    pub async fn cancel_subscription(&self, subscription_id: &str, immediate: bool) -> BillingResult<()> {
        let mut request = self
            .http
            .delete(format!("{}/subscriptions/{}", self.base_url, subscription_id))
            .basic_auth(&self.api_user, Some(&self.api_password));
        if immediate {
            request = request.query(&[("billingPeriod", "0")]);
        }

        let response = request.send().await.map_err(vendor_error)?;
        let body: SubscriptionActionResponse = read_json(response).await?;

        match body.subscriptions.first() {
            Some(r) if r.result == "success" => {
                tracing::info!(subscription_id = %subscription_id, immediate, "FastSpring subscription canceled");
                Ok(())
            }
            Some(r) => Err(BillingError::CancellationFailed(format!(
                "fastspring: {}",
                r.error.as_ref().map(Value::to_string).unwrap_or_else(|| r.result.clone())
            ))),
            None => Err(BillingError::CancellationFailed("fastspring: empty response".into())),
        }
    }

    /// Order that started the subscription; the trial fee was charged on it.
    pub async fn initial_order_id(&self, subscription_id: &str) -> BillingResult<String> {
        let response = self
            .http
            .get(format!("{}/subscriptions/{}", self.base_url, subscription_id))
            .basic_auth(&self.api_user, Some(&self.api_password))
            .send()
            .await
            .map_err(vendor_error)?;
        let details: SubscriptionDetails = read_json(response).await?;
        details.initial_order_id.ok_or(BillingError::NoRefundableCharge)
    }

    pub async fn order(&self, order_id: &str) -> BillingResult<FastSpringOrder> {
        let response = self
            .http
            .get(format!("{}/orders/{}", self.base_url, order_id))
            .basic_auth(&self.api_user, Some(&self.api_password))
            .send()
            .await
            .map_err(vendor_error)?;
        let order: OrderDetails = read_json(response).await?;
        Ok(FastSpringOrder {
            amount_cents: order.total.map(|t| (t * 100.0).round() as i64).unwrap_or(0),
            order_id: order.id,
            currency: order.currency,
        })
    }

    /// Full return of an order. Returns the FastSpring return id.
    pub async fn create_return(&self, order_id: &str, reason: &str) -> BillingResult<String> {
        let body = serde_json::json!({
            "returns": [{
                "order": order_id,
                "reason": "Customer request",
                "note": reason,
            }]
        });

        let response = self
            .http
            .post(format!("{}/returns", self.base_url))
            .basic_auth(&self.api_user, Some(&self.api_password))
            .json(&body)
            .send()
            .await
            .map_err(vendor_error)?;
        let body: ReturnsResponse = read_json(response).await?;

        match body.returns.into_iter().next() {
            Some(ReturnResult {
                return_id: Some(id),
                result,
                ..
            }) if result == "success" => Ok(id),
            Some(r) => Err(BillingError::RefundFailed(format!(
                "fastspring: {}",
                r.error.as_ref().map(Value::to_string).unwrap_or(r.result)
            ))),
            None => Err(BillingError::RefundFailed("fastspring: empty response".into())),
        }
    }
}

fn vendor_error(e: reqwest::Error) -> BillingError {
    BillingError::VendorApi {
        provider: "fastspring",
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> BillingResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BillingError::VendorApi {
            provider: "fastspring",
            status: Some(status.as_u16()),
            message: body,
        });
    }
    response.json::<T>().await.map_err(vendor_error)
}

/// Acknowledgement body: processed event ids, newline separated.
pub fn acknowledgement_body(ids: &[String]) -> String {
    ids.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindscore_shared::SubscriptionStatus;
    use serde_json::json;

    const SECRET: &str = "fs_secret";

    fn parser() -> FastSpringWebhookParser {
        FastSpringWebhookParser::new(SECRET.into())
    }

    fn single(event: Value) -> VendorEvent {
        parser().parse_stored(&event).unwrap()
    }

    #[test]
    fn test_signature_roundtrip() {
        let body = br#"{"events":[]}"#;
        let sig = sign_payload(SECRET, body).unwrap();
        assert!(parser().verify(body, &sig).is_ok());
        assert!(parser().verify(body, "bm9wZQ==").is_err());
        assert!(parser().verify(br#"{"events":[1]}"#, &sig).is_err());
    }

    #[test]
    fn test_batch_parses_every_event() {
        let body = json!({"events": [
            {"id": "e1", "type": "subscription.charge.completed", "created": 1_700_000_000_000_i64,
             "data": {"subscription": "sub1", "total": 29.99}},
            {"id": "e2", "type": "mailingListEntry.updated", "created": 1_700_000_000_000_i64, "data": {}}
        ]});
        let delivery = parser().parse(body.to_string().as_bytes()).unwrap();
        assert!(delivery.rejected.is_empty());
        let events = delivery.events;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].event.event,
            PaymentEvent::RenewalPaid {
                subscription_id: "sub1".into(),
                amount_cents: Some(2999)
            }
        );
        assert_eq!(events[0].event.occurred_at.unix_timestamp(), 1_700_000_000);
        assert!(matches!(events[1].event.event, PaymentEvent::Ignored { .. }));
        assert_eq!(events[1].raw["id"], "e2");
    }

    #[test]
    fn test_malformed_member_does_not_sink_batch() {
        let body = json!({"events": [
            {"id": "e1", "type": "subscription.charge.completed", "created": 1_700_000_000_000_i64,
             "data": {"subscription": "sub1", "total": 29.99}},
            {"id": "e2", "created": 1_700_000_000_000_i64}
        ]});
        let delivery = parser().parse(body.to_string().as_bytes()).unwrap();

        assert_eq!(delivery.events.len(), 1);
        assert_eq!(delivery.events[0].event.event_id, "e1");
        assert_eq!(delivery.rejected.len(), 1);
        assert_eq!(delivery.rejected[0].event_id, "e2");
        assert!(delivery.rejected[0].error.contains("type"));
    }

    #[test]
    fn test_member_without_id_is_rejected_as_unknown() {
        let body = json!({"events": [{"type": "order.completed", "data": {}}]});
        let delivery = parser().parse(body.to_string().as_bytes()).unwrap();
        assert!(delivery.events.is_empty());
        assert_eq!(delivery.rejected[0].event_id, "unknown");
    }

    #[test]
    fn test_event_without_created_is_current() {
        let event = single(json!({
            "id": "e1", "type": "subscription.charge.failed",
            "data": {"subscription": "sub1"}
        }));
        let age = OffsetDateTime::now_utc() - event.occurred_at;
        assert!(age.whole_seconds().abs() < 5);
    }

    #[test]
    fn test_order_completed_maps_buyer() {
        let event = single(json!({
            "id": "e1", "type": "order.completed", "created": 0,
            "data": {
                "customer": {"email": "Buyer@Example.com", "first": "Ada"},
                "account": {"id": "acct1"},
                "items": [{"product": "trial"}, {"product": "monthly", "subscription": "sub9"}],
                "tags": {"iq": 131},
                "total": 1.0,
                "currency": "USD"
            }
        }));
        let PaymentEvent::CheckoutCompleted(details) = event.event else {
            panic!("expected checkout");
        };
        assert_eq!(details.email, "Buyer@Example.com");
        assert_eq!(details.user_name.as_deref(), Some("Ada"));
        assert_eq!(details.iq, Some(131));
        assert_eq!(details.subscription_id.as_deref(), Some("sub9"));
        assert_eq!(details.customer_ref.as_deref(), Some("acct1"));
        assert_eq!(details.amount_cents, Some(100));
    }

    #[test]
    fn test_activation_in_trial_carries_trial_end() {
        let event = single(json!({
            "id": "e1", "type": "subscription.activated", "created": 0,
            "data": {"id": "sub1", "state": "trial", "nextChargeDate": 1_800_000_000_000_i64}
        }));
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(event.event.target_status(now), Some(SubscriptionStatus::Trial));
    }

    #[test]
    fn test_cancel_waits_for_deactivation() {
        let canceled = single(json!({
            "id": "e1", "type": "subscription.canceled", "created": 0,
            "data": {"id": "sub1", "state": "canceled", "nextChargeDate": 1_800_000_000_000_i64}
        }));
        assert!(matches!(canceled.event, PaymentEvent::Ignored { .. }));

        let deactivated = single(json!({
            "id": "e2", "type": "subscription.deactivated", "created": 0,
            "data": {"id": "sub1", "state": "deactivated"}
        }));
        assert_eq!(
            deactivated.event,
            PaymentEvent::SubscriptionCanceled { subscription_id: "sub1".into() }
        );
    }

    #[test]
    fn test_return_created_maps_refund() {
        let event = single(json!({
            "id": "e1", "type": "return.created", "created": 0,
            "data": {"account": "acct1", "totalReturn": 1.5,
                     "original": {"id": "ord1", "subscriptions": ["sub1"]}}
        }));
        assert_eq!(
            event.event,
            PaymentEvent::Refunded {
                subscription_id: Some("sub1".into()),
                customer_ref: Some("acct1".into()),
                amount_cents: Some(150)
            }
        );
    }

    #[test]
    fn test_acknowledgement_body() {
        assert_eq!(acknowledgement_body(&["a".into(), "b".into()]), "a\nb");
        assert_eq!(acknowledgement_body(&[]), "");
    }

    #[tokio::test]
    async fn test_cancel_subscription_immediately() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/subscriptions/sub1")
            .match_query(mockito::Matcher::UrlEncoded("billingPeriod".into(), "0".into()))
            .match_header("authorization", mockito::Matcher::Regex("^Basic ".into()))
            .with_status(200)
            .with_body(r#"{"subscriptions":[{"subscription":"sub1","action":"subscription.cancel","result":"success"}]}"#)
            .create_async()
            .await;

        let client = FastSpringClient::new(server.url(), "user".into(), "pass".into());
        client.cancel_subscription("sub1", true).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancel_reports_vendor_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/subscriptions/sub1")
            .with_status(200)
            .with_body(r#"{"subscriptions":[{"subscription":"sub1","result":"error","error":{"subscription":"not found"}}]}"#)
            .create_async()
            .await;

        let client = FastSpringClient::new(server.url(), "user".into(), "pass".into());
        let err = client.cancel_subscription("sub1", false).await.unwrap_err();
        assert!(matches!(err, BillingError::CancellationFailed(_)));
    }

    #[tokio::test]
    async fn test_create_return() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/returns")
            .match_body(mockito::Matcher::PartialJson(json!({"returns": [{"order": "ord1"}]})))
            .with_status(200)
            .with_body(r#"{"returns":[{"return":"ret1","result":"success"}]}"#)
            .create_async()
            .await;

        let client = FastSpringClient::new(server.url(), "user".into(), "pass".into());
        assert_eq!(client.create_return("ord1", "requested").await.unwrap(), "ret1");
    }

    #[tokio::test]
    async fn test_order_lookup_converts_total() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/orders/ord1")
            .with_status(200)
            .with_body(r#"{"id":"ord1","total":1.99,"currency":"EUR"}"#)
            .create_async()
            .await;

        let client = FastSpringClient::new(server.url(), "user".into(), "pass".into());
        let order = client.order("ord1").await.unwrap();
        assert_eq!(
            order,
            FastSpringOrder {
                order_id: "ord1".into(),
                amount_cents: 199,
                currency: Some("EUR".into())
            }
        );
    }

    #[tokio::test]
    async fn test_http_error_status_is_vendor_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subscriptions/sub1")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let client = FastSpringClient::new(server.url(), "user".into(), "bad".into());
        let err = client.initial_order_id("sub1").await.unwrap_err();
        assert!(matches!(err, BillingError::VendorApi { status: Some(401), .. }));
    }
}
