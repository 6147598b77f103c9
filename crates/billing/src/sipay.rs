//! Sipay MDWR client and notification parser
//!
//! Every request body is signed with the merchant app secret (hex
//! HMAC-SHA256 in `X-Sipay-Signature`) and carries the merchant key. Sipay has
//! no customer object, so the initial payment id doubles as the customer
//! reference used for refunds.

use std::collections::HashMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use time::OffsetDateTime;
use tokio_retry::RetryIf;

use mindscore_shared::{config_keys, PaymentProvider, SiteConfigStore};

use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{PaymentEvent, VendorEvent};
use crate::provisioning::CheckoutDetails;
use crate::webhooks::{timestamp_or_now, IncomingEvent, ParsedDelivery, WebhookParser};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_SIPAY_BASE_URL: &str = "https://api.sipay.com.tr";
const MAX_ATTEMPTS: usize = 3;

pub fn sign_body(secret: &str, body: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::MissingConfig("sipay app secret".into()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone)]
pub struct SipayConfig {
    pub base_url: String,
    pub merchant_key: String,
    pub app_secret: String,
    pub recurring_plan: Option<String>,
}

impl SipayConfig {
    pub async fn from_site_config(store: &SiteConfigStore) -> BillingResult<Self> {
        let merchant_key = store
            .get_or_env(config_keys::SIPAY_MERCHANT_KEY)
            .await?
            .ok_or_else(|| BillingError::ProviderNotConfigured("sipay merchant key".into()))?;
        let app_secret = store
            .get_or_env(config_keys::SIPAY_APP_SECRET)
            .await?
            .ok_or_else(|| BillingError::ProviderNotConfigured("sipay app secret".into()))?;
        Ok(Self {
            base_url: store
                .get_or_env(config_keys::SIPAY_BASE_URL)
                .await?
                .unwrap_or_else(|| DEFAULT_SIPAY_BASE_URL.to_string()),
            merchant_key,
            app_secret,
            recurring_plan: store.get_or_env(config_keys::SIPAY_RECURRING_PLAN).await?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePaymentRequest {
    /// Our reference; also sent as the idempotency key.
    pub order_ref: String,
    pub email: String,
    pub amount_cents: i64,
    pub currency: String,
    pub recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring_plan: Option<String>,
    pub return_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CreatedPayment {
    pub payment_id: String,
    /// Hosted 3-D Secure page.
    pub redirect_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SipayPayment {
    pub payment_id: String,
    pub status: String,
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub recurring_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SipayRefund {
    pub refund_id: String,
    pub status: String,
}

#[derive(Clone)]
pub struct SipayClient {
    http: Client,
    config: SipayConfig,
}

impl SipayClient {
    pub fn new(config: SipayConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    pub async fn from_site_config(store: &SiteConfigStore) -> BillingResult<Self> {
        Ok(Self::new(SipayConfig::from_site_config(store).await?))
    }

    pub fn config(&self) -> &SipayConfig {
        &self.config
    }

    pub async fn create_payment(&self, request: &CreatePaymentRequest) -> BillingResult<CreatedPayment> {
        let body = serde_json::to_value(request).map_err(|e| BillingError::Internal(e.to_string()))?;
        let created: CreatedPayment = self
            .call(Method::POST, "/mdwr/v1/payments", Some(&body), Some(&request.order_ref))
            .await?;

        tracing::info!(
            order_ref = %request.order_ref,
            payment_id = %created.payment_id,
            amount_cents = request.amount_cents,
            "Sipay payment created"
        );
        Ok(created)
    }

    pub async fn payment_status(&self, payment_id: &str) -> BillingResult<SipayPayment> {
        self.call(Method::GET, &format!("/mdwr/v1/payments/{payment_id}"), None, None)
            .await
    }

    /// Refund `amount_cents` of a captured payment; `None` refunds it in full.
    pub async fn refund(
        &self,
        payment_id: &str,
        amount_cents: Option<i64>,
        reason: &str,
    ) -> BillingResult<SipayRefund> {
        let body = serde_json::json!({
            "amount_cents": amount_cents,
            "reason": reason,
        });
        self.call(
            Method::POST,
            &format!("/mdwr/v1/payments/{payment_id}/refunds"),
            Some(&body),
            None,
        )
        .await
        .map_err(|e| match e {
            BillingError::VendorApi { status: Some(s), message, .. } if s < 500 => {
                BillingError::RefundFailed(format!("sipay: {message}"))
            }
            other => other,
        })
    }

    pub async fn cancel_recurring(&self, recurring_id: &str) -> BillingResult<()> {
        let _: Value = self
            .call(
                Method::POST,
                &format!("/mdwr/v1/recurring/{recurring_id}/cancel"),
                Some(&serde_json::json!({})),
                None,
            )
            .await
            .map_err(|e| match e {
                BillingError::VendorApi { status: Some(s), message, .. } if s < 500 => {
                    BillingError::CancellationFailed(format!("sipay: {message}"))
                }
                other => other,
            })?;
        tracing::info!(recurring_id = %recurring_id, "Sipay recurring plan canceled");
        Ok(())
    }

    /// Signed request with retries on transport errors and 5xx.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> BillingResult<T> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let bytes = match body {
            Some(v) => serde_json::to_vec(v).map_err(|e| BillingError::Internal(e.to_string()))?,
            None => Vec::new(),
        };
        let signature = sign_body(&self.config.app_secret, &bytes)?;

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(8))
            .map(jitter)
            .take(MAX_ATTEMPTS - 1);

        let http = &self.http;
        let merchant_key = self.config.merchant_key.as_str();
        let url_ref = url.as_str();
        let bytes_ref = &bytes;
        let signature_ref = signature.as_str();
        let method_ref = &method;

        let text = RetryIf::spawn(
            strategy,
            || async move {
                let mut request = http
                    .request(method_ref.clone(), url_ref)
                    .header("X-Merchant-Key", merchant_key)
                    .header("X-Sipay-Signature", signature_ref);
                if !bytes_ref.is_empty() {
                    request = request
                        .header(reqwest::header::CONTENT_TYPE, "application/json")
                        .body(bytes_ref.clone());
                }
                if let Some(key) = idempotency_key {
                    request = request.header("Idempotency-Key", key);
                }

                let response = request.send().await.map_err(|e| CallError {
                    status: None,
                    message: e.to_string(),
                })?;
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                if status.is_success() {
                    Ok(text)
                } else {
                    Err(CallError {
                        status: Some(status),
                        message: text,
                    })
                }
            },
            CallError::is_retryable,
        )
        .await
        .map_err(|e| {
            tracing::error!(url = %url, status = ?e.status, error = %e.message, "Sipay request failed");
            BillingError::VendorApi {
                provider: "sipay",
                status: e.status.map(|s| s.as_u16()),
                message: e.message,
            }
        })?;

        serde_json::from_str(&text).map_err(|e| BillingError::VendorApi {
            provider: "sipay",
            status: None,
            message: format!("unexpected response: {e}"),
        })
    }
}

#[derive(Debug)]
struct CallError {
    status: Option<StatusCode>,
    message: String,
}

impl CallError {
    fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(default)]
    event_id: Option<String>,
    status: String,
    payment_id: String,
    #[serde(default)]
    recurring_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    amount_cents: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    /// Unix seconds. Absent on some gateway retries.
    #[serde(default)]
    occurred_at: Option<i64>,
    #[serde(default)]
    trial_end: Option<i64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

pub struct SipayWebhookParser {
    app_secret: String,
}

impl SipayWebhookParser {
    pub fn new(app_secret: String) -> Self {
        Self { app_secret }
    }
}

impl WebhookParser for SipayWebhookParser {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Sipay
    }

    fn verify(&self, payload: &[u8], signature: &str) -> BillingResult<()> {
        let expected = sign_body(&self.app_secret, payload)?;
        let provided = signature.trim().to_ascii_lowercase();
        if expected.len() == provided.len() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
            Ok(())
        } else {
            tracing::warn!("Sipay notification signature mismatch");
            Err(BillingError::WebhookSignatureInvalid)
        }
    }

    fn parse(&self, payload: &[u8]) -> BillingResult<ParsedDelivery> {
        let raw: Value = serde_json::from_slice(payload)?;
        let event = self.parse_stored(&raw)?;
        Ok(ParsedDelivery::single(IncomingEvent { raw, event }))
    }

    fn parse_stored(&self, raw: &Value) -> BillingResult<VendorEvent> {
        let n: Notification = serde_json::from_value(raw.clone())?;
        Ok(map_notification(n))
    }
}

fn map_notification(n: Notification) -> VendorEvent {
    // Sipay retries a notification with the same payment/status pair.
    let event_id = n
        .event_id
        .clone()
        .unwrap_or_else(|| format!("{}:{}", n.payment_id, n.status));
    let recurring = n.recurring_id.clone();

    let event = match (n.status.as_str(), recurring) {
        ("paid", _) => PaymentEvent::CheckoutCompleted(CheckoutDetails {
            email: n.email.clone().unwrap_or_default(),
            user_name: n.metadata.get("user_name").cloned(),
            iq: n.metadata.get("iq").and_then(|v| v.parse().ok()),
            subscription_id: n.recurring_id.clone(),
            customer_ref: Some(n.payment_id.clone()),
            trial_end: n.trial_end.map(timestamp_or_now),
            amount_cents: n.amount_cents,
            currency: n.currency.clone(),
        }),
        ("recurring_paid", Some(subscription_id)) => PaymentEvent::RenewalPaid {
            subscription_id,
            amount_cents: n.amount_cents,
        },
        ("failed", Some(subscription_id)) => PaymentEvent::PaymentFailed {
            subscription_id,
            reason: n.reason.clone(),
        },
        ("canceled", Some(subscription_id)) => PaymentEvent::SubscriptionCanceled { subscription_id },
        ("refunded", recurring) => PaymentEvent::Refunded {
            subscription_id: recurring,
            customer_ref: Some(n.payment_id.clone()),
            amount_cents: n.amount_cents,
        },
        _ => PaymentEvent::Ignored {
            event_type: n.status.clone(),
        },
    };

    VendorEvent {
        provider: PaymentProvider::Sipay,
        event_id,
        event_type: n.status,
        occurred_at: n
            .occurred_at
            .map_or_else(OffsetDateTime::now_utc, timestamp_or_now),
        event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "app_secret";

    fn client(url: String) -> SipayClient {
        SipayClient::new(SipayConfig {
            base_url: url,
            merchant_key: "mk_1".into(),
            app_secret: SECRET.into(),
            recurring_plan: Some("monthly".into()),
        })
    }

    fn payment_request() -> CreatePaymentRequest {
        CreatePaymentRequest {
            order_ref: "ord_1".into(),
            email: "buyer@example.com".into(),
            amount_cents: 100,
            currency: "USD".into(),
            recurring: true,
            recurring_plan: Some("monthly".into()),
            return_url: "https://app/return".into(),
            cancel_url: "https://app/cancel".into(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_payment_signs_request() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::to_vec(&serde_json::to_value(payment_request()).unwrap()).unwrap();
        let signature = sign_body(SECRET, &body).unwrap();

        let mock = server
            .mock("POST", "/mdwr/v1/payments")
            .match_header("x-merchant-key", "mk_1")
            .match_header("x-sipay-signature", signature.as_str())
            .match_header("idempotency-key", "ord_1")
            .with_status(200)
            .with_body(r#"{"payment_id":"pay_1","redirect_url":"https://3ds/pay_1"}"#)
            .create_async()
            .await;

        let created = client(server.url()).create_payment(&payment_request()).await.unwrap();
        assert_eq!(created.payment_id, "pay_1");
        assert_eq!(created.redirect_url, "https://3ds/pay_1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/mdwr/v1/payments/pay_1")
            .with_status(503)
            .expect(MAX_ATTEMPTS)
            .create_async()
            .await;

        let err = client(server.url()).payment_status("pay_1").await.unwrap_err();
        assert!(matches!(err, BillingError::VendorApi { status: Some(503), .. }));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mdwr/v1/payments/pay_1/refunds")
            .with_status(422)
            .with_body("amount exceeds captured amount")
            .expect(1)
            .create_async()
            .await;

        let err = client(server.url()).refund("pay_1", Some(5000), "test").await.unwrap_err();
        assert!(matches!(err, BillingError::RefundFailed(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancel_recurring() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mdwr/v1/recurring/rec_1/cancel")
            .with_status(200)
            .with_body(r#"{"status":"canceled"}"#)
            .create_async()
            .await;

        client(server.url()).cancel_recurring("rec_1").await.unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_notification_signature() {
        let parser = SipayWebhookParser::new(SECRET.into());
        let body = br#"{"status":"paid","payment_id":"pay_1"}"#;
        let sig = sign_body(SECRET, body).unwrap();
        assert!(parser.verify(body, &sig).is_ok());
        assert!(parser.verify(body, &sig.to_ascii_uppercase()).is_ok());
        assert!(parser.verify(body, "00").is_err());
    }

    #[test]
    fn test_paid_notification_provisions_buyer() {
        let parser = SipayWebhookParser::new(SECRET.into());
        let raw = json!({
            "status": "paid",
            "payment_id": "pay_1",
            "recurring_id": "rec_1",
            "email": "buyer@example.com",
            "amount_cents": 100,
            "currency": "TRY",
            "occurred_at": 1_700_000_000,
            "metadata": {"user_name": "Ada", "iq": "128"}
        });
        let event = parser.parse_stored(&raw).unwrap();
        assert_eq!(event.event_id, "pay_1:paid");
        let PaymentEvent::CheckoutCompleted(details) = event.event else {
            panic!("expected checkout");
        };
        assert_eq!(details.subscription_id.as_deref(), Some("rec_1"));
        assert_eq!(details.customer_ref.as_deref(), Some("pay_1"));
        assert_eq!(details.iq, Some(128));
    }

    #[test]
    fn test_status_mapping() {
        let parser = SipayWebhookParser::new(SECRET.into());
        let parse = |status: &str, recurring: Option<&str>| {
            parser
                .parse_stored(&json!({
                    "event_id": "n1", "status": status, "payment_id": "pay_2",
                    "recurring_id": recurring, "amount_cents": 2999
                }))
                .unwrap()
                .event
        };

        assert_eq!(
            parse("recurring_paid", Some("rec_1")),
            PaymentEvent::RenewalPaid { subscription_id: "rec_1".into(), amount_cents: Some(2999) }
        );
        assert!(matches!(parse("failed", Some("rec_1")), PaymentEvent::PaymentFailed { .. }));
        assert!(matches!(parse("canceled", Some("rec_1")), PaymentEvent::SubscriptionCanceled { .. }));
        assert!(matches!(parse("refunded", None), PaymentEvent::Refunded { .. }));
        assert!(matches!(parse("failed", None), PaymentEvent::Ignored { .. }));
        assert!(matches!(parse("pending", Some("rec_1")), PaymentEvent::Ignored { .. }));
    }

    #[test]
    fn test_notification_without_timestamp_is_current() {
        use crate::lifecycle::{plan_transition, TransitionPlan};
        use mindscore_shared::{SubscriptionStatus, TransitionTrigger};

        let parser = SipayWebhookParser::new(SECRET.into());
        let event = parser
            .parse_stored(&json!({"status": "failed", "payment_id": "p1", "recurring_id": "r1"}))
            .unwrap();

        let now = OffsetDateTime::now_utc();
        assert!((now - event.occurred_at).whole_seconds().abs() < 5);

        let changed_three_days_ago = Some(now - time::Duration::days(3));
        assert_eq!(
            plan_transition(
                SubscriptionStatus::Active,
                changed_three_days_ago,
                SubscriptionStatus::PastDue,
                event.occurred_at,
                TransitionTrigger::Vendor,
            ),
            TransitionPlan::Apply
        );
    }

    #[test]
    fn test_notification_timestamp_is_kept() {
        let parser = SipayWebhookParser::new(SECRET.into());
        let event = parser
            .parse_stored(&json!({
                "status": "recurring_paid", "payment_id": "p1", "recurring_id": "r1",
                "occurred_at": 1_700_000_000
            }))
            .unwrap();
        assert_eq!(event.occurred_at.unix_timestamp(), 1_700_000_000);
    }
}
