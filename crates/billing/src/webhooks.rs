//! Webhook ingestion
//!
//! Each vendor gets a [`WebhookParser`] that verifies the signature and turns
//! the body into one or more [`VendorEvent`]s. [`WebhookHandler`] then runs
//! every event through the ledger (claim, apply, record result), so Stripe,
//! FastSpring and Sipay share idempotency and replay.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use mindscore_shared::{config_keys, PaymentProvider, SiteConfigStore};

use crate::error::{BillingError, BillingResult};
use crate::fastspring::FastSpringWebhookParser;
use crate::ledger::{ClaimResult, WebhookLedger, WebhookReplayResult};
use crate::lifecycle::{LifecycleOutcome, LifecycleService, VendorEvent};
use crate::sipay::SipayWebhookParser;
use crate::stripe_webhook::StripeWebhookParser;

/// A single parsed event together with the JSON stored for replay.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub raw: serde_json::Value,
    pub event: VendorEvent,
}

/// Signature check and payload parsing for one vendor.
pub trait WebhookParser: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    fn verify(&self, payload: &[u8], signature: &str) -> BillingResult<()>;

    /// Parse a verified body. FastSpring batches several events per delivery;
    /// a malformed member lands in [`ParsedDelivery::rejected`] and only an
    /// unreadable envelope is an error.
    fn parse(&self, payload: &[u8]) -> BillingResult<ParsedDelivery>;

    /// Rebuild an event from the JSON kept in the ledger.
    fn parse_stored(&self, raw: &serde_json::Value) -> BillingResult<VendorEvent>;
}

#[derive(Debug, Clone, Serialize)]
pub struct EventFailure {
    pub event_id: String,
    pub error: String,
}

/// Events of one delivery, split into parsed and unparseable members.
#[derive(Debug, Default)]
pub struct ParsedDelivery {
    pub events: Vec<IncomingEvent>,
    pub rejected: Vec<EventFailure>,
}

impl ParsedDelivery {
    pub fn single(event: IncomingEvent) -> Self {
        Self {
            events: vec![event],
            rejected: Vec::new(),
        }
    }
}

/// Result of one delivery. Duplicates count as acknowledged.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReport {
    pub provider: PaymentProvider,
    pub acknowledged: Vec<String>,
    pub failed: Vec<EventFailure>,
}

impl WebhookReport {
    fn new(provider: PaymentProvider) -> Self {
        Self {
            provider,
            acknowledged: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct WebhookHandler {
    ledger: WebhookLedger,
    lifecycle: LifecycleService,
    site_config: SiteConfigStore,
    stripe_webhook_secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, lifecycle: LifecycleService, stripe_webhook_secret: Option<String>) -> Self {
        Self {
            ledger: WebhookLedger::new(pool.clone()),
            site_config: SiteConfigStore::new(pool),
            lifecycle,
            stripe_webhook_secret,
        }
    }

    pub fn ledger(&self) -> &WebhookLedger {
        &self.ledger
    }

    /// Secrets are resolved per call so admin rotations apply immediately.
    async fn parser_for(&self, provider: PaymentProvider) -> BillingResult<Box<dyn WebhookParser>> {
        let parser: Box<dyn WebhookParser> = match provider {
            PaymentProvider::Stripe => {
                let secret = self
                    .stripe_webhook_secret
                    .clone()
                    .ok_or_else(|| BillingError::ProviderNotConfigured("stripe".into()))?;
                Box::new(StripeWebhookParser::new(secret))
            }
            PaymentProvider::FastSpring => {
                let secret = self
                    .site_config
                    .get_or_env(config_keys::FASTSPRING_WEBHOOK_SECRET)
                    .await?
                    .ok_or_else(|| BillingError::ProviderNotConfigured("fastspring".into()))?;
                Box::new(FastSpringWebhookParser::new(secret))
            }
            PaymentProvider::Sipay => {
                let secret = self
                    .site_config
                    .get_or_env(config_keys::SIPAY_APP_SECRET)
                    .await?
                    .ok_or_else(|| BillingError::ProviderNotConfigured("sipay".into()))?;
                Box::new(SipayWebhookParser::new(secret))
            }
        };
        Ok(parser)
    }

    /// Verify, parse and process a delivery.
    ///
    /// Signature and parse failures are returned as errors (nothing was
    /// stored). Per-event processing failures are collected in the report so
    /// one bad event in a FastSpring batch does not block the others.
    pub async fn handle(
        &self,
        provider: PaymentProvider,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<WebhookReport> {
        let parser = self.parser_for(provider).await?;

        let signature = signature.ok_or_else(|| {
            tracing::warn!(provider = %provider, "Webhook delivered without signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        parser.verify(payload, signature)?;

        let delivery = parser.parse(payload)?;
        let mut report = WebhookReport::new(provider);

        for rejected in delivery.rejected {
            tracing::error!(
                provider = %provider,
                event_id = %rejected.event_id,
                error = %rejected.error,
                "Webhook event could not be parsed"
            );
            report.failed.push(rejected);
        }

        for item in delivery.events {
            let event_id = item.event.event_id.clone();
            match self.process(&item).await {
                Ok(_) => report.acknowledged.push(event_id),
                Err(e) => {
                    tracing::error!(
                        provider = %provider,
                        event_id = %event_id,
                        error = %e,
                        "Webhook event processing failed"
                    );
                    report.failed.push(EventFailure {
                        event_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn process(&self, item: &IncomingEvent) -> BillingResult<Option<LifecycleOutcome>> {
        let event = &item.event;
        let record_id = match self
            .ledger
            .claim(event.provider, &event.event_id, &event.event_type, event.occurred_at, &item.raw)
            .await?
        {
            ClaimResult::Claimed(id) => id,
            ClaimResult::Duplicate { .. } => return Ok(None),
        };

        tracing::info!(
            provider = %event.provider,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.lifecycle.apply(event).await;
        let status = result.as_ref().map(|_| ()).map_err(clone_error);
        self.ledger.finish(record_id, &status).await;

        result.map(Some)
    }

    /// Re-run a stored event from its saved payload. Signatures are not
    /// re-checked; the payload was verified when it was first stored.
    pub async fn replay_webhook(&self, record_id: Uuid) -> BillingResult<WebhookReplayResult> {
        let stored = self.ledger.load(record_id).await?;
        let provider: PaymentProvider = stored.provider.parse()?;
        let parser = self.parser_for(provider).await?;
        let event = parser.parse_stored(&stored.payload)?;

        tracing::info!(
            record_id = %record_id,
            provider = %provider,
            event_id = %stored.event_id,
            previous_status = %stored.processing_result,
            "Replaying webhook event"
        );

        self.ledger.mark_replaying(&stored).await?;
        let result = self.lifecycle.apply(&event).await.map(|_| ());
        self.ledger.finish(record_id, &result).await;

        let (new_status, new_error) = match &result {
            Ok(()) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        tracing::info!(
            record_id = %record_id,
            new_status = %new_status,
            success = result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id,
            provider: stored.provider,
            event_id: stored.event_id,
            event_type: stored.event_type,
            previous_status: stored.processing_result,
            previous_error: stored.error_message,
            new_status,
            new_error,
            success: result.is_ok(),
        })
    }

    pub async fn replay_all_failed(&self, max_events: Option<i64>) -> BillingResult<Vec<WebhookReplayResult>> {
        let ids = self.ledger.failed_ids(max_events.unwrap_or(100)).await?;
        let mut results = Vec::with_capacity(ids.len());

        for id in ids {
            match self.replay_webhook(id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(record_id = %id, error = %e, "Failed to replay webhook");
                    results.push(WebhookReplayResult {
                        record_id: id,
                        provider: "unknown".to_string(),
                        event_id: String::new(),
                        event_type: "unknown".to_string(),
                        previous_status: "error".to_string(),
                        previous_error: None,
                        new_status: "error".to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }
}

/// `BillingError` is not `Clone`; the ledger only needs the message.
fn clone_error(e: &BillingError) -> BillingError {
    BillingError::Internal(e.to_string())
}

/// Unix seconds to `OffsetDateTime`, falling back to now for garbage input.
pub(crate) fn timestamp_or_now(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or_else(|_| OffsetDateTime::now_utc())
}
