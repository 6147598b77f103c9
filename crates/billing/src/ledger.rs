//! Webhook event ledger
//!
//! One row per `(provider, event_id)` in `webhook_events`, holding the raw
//! payload so failed events can be replayed without the vendor resending.
//!
//! Claiming uses `INSERT ... ON CONFLICT ... DO UPDATE ... WHERE ... RETURNING`
//! so only one concurrent delivery gets the row. A redelivery reclaims rows
//! that ended in `error`, and rows stuck in `processing` or `replaying` longer
//! than [`PROCESSING_TIMEOUT_MINUTES`].

use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use mindscore_shared::PaymentProvider;

use crate::error::{BillingError, BillingResult};

pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    Processing,
    Success,
    Error,
    Replaying,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Processing => "processing",
            ProcessingResult::Success => "success",
            ProcessingResult::Error => "error",
            ProcessingResult::Replaying => "replaying",
        }
    }
}

/// Outcome of trying to claim a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed(Uuid),
    Duplicate { existing_status: Option<String> },
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Row used for replay: the record plus its stored payload.
#[derive(Debug, Clone, FromRow)]
pub struct StoredWebhook {
    pub id: Uuid,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

#[derive(Clone)]
pub struct WebhookLedger {
    pool: PgPool,
}

impl WebhookLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn claim(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        payload: &serde_json::Value,
    ) -> BillingResult<ClaimResult> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (provider, event_id, event_type, event_timestamp, payload,
                 processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, $5, 'processing', NOW())
            ON CONFLICT (provider, event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CASE webhook_events.processing_result
                    WHEN 'error' THEN CONCAT('Redelivered after error: ',
                                             COALESCE(webhook_events.error_message, 'none'))
                    ELSE CONCAT('Recovered from stuck state at ', NOW()::TEXT)
                END
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result IN ('processing', 'replaying')
                   AND webhook_events.processing_started_at < NOW() - ($6 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(provider.as_str())
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(payload)
        .bind(PROCESSING_TIMEOUT_MINUTES.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                provider = %provider,
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event"
            );
            BillingError::Database(e.to_string())
        })?;

        if let Some((id,)) = claimed {
            return Ok(ClaimResult::Claimed(id));
        }

        let existing_status: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM webhook_events WHERE provider = $1 AND event_id = $2",
        )
        .bind(provider.as_str())
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        let existing_status = existing_status.map(|(s,)| s);
        tracing::info!(
            provider = %provider,
            event_id = %event_id,
            event_type = %event_type,
            existing_status = ?existing_status,
            "Duplicate webhook delivery"
        );

        Ok(ClaimResult::Duplicate { existing_status })
    }

    /// Record the processing result. Retried once since a lost update leaves
    /// the row in `processing` until the stuck timeout.
    pub async fn finish(&self, record_id: Uuid, result: &BillingResult<()>) {
        let (status, error_message) = match result {
            Ok(()) => (ProcessingResult::Success, None),
            Err(e) => (ProcessingResult::Error, Some(e.to_string())),
        };

        for attempt in 1..=2 {
            let update = sqlx::query(
                "UPDATE webhook_events SET processing_result = $1, error_message = $2 WHERE id = $3",
            )
            .bind(status.as_str())
            .bind(&error_message)
            .bind(record_id)
            .execute(&self.pool)
            .await;

            match update {
                Ok(_) => return,
                Err(e) if attempt == 1 => {
                    tracing::warn!(record_id = %record_id, error = %e, "Webhook result update failed, retrying");
                }
                Err(e) => {
                    tracing::error!(
                        record_id = %record_id,
                        processing_result = status.as_str(),
                        error_message = ?error_message,
                        error = %e,
                        "Failed to record webhook result after retry; row stays in processing"
                    );
                }
            }
        }
    }

    pub async fn list(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT id, provider, event_id, event_type, event_timestamp,
                   processing_result, processing_started_at, error_message, created_at
            FROM webhook_events
            WHERE ($1::TEXT IS NULL OR processing_result = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status_filter)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn load(&self, record_id: Uuid) -> BillingResult<StoredWebhook> {
        sqlx::query_as::<_, StoredWebhook>(
            r#"
            SELECT id, provider, event_id, event_type, processing_result, error_message, payload
            FROM webhook_events
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("webhook event {record_id}")))
    }

    /// Fails when the row moved since `stored` was loaded, e.g. a vendor
    /// redelivery claimed it.
    pub async fn mark_replaying(&self, stored: &StoredWebhook) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = 'replaying',
                processing_started_at = NOW(),
                error_message = CONCAT('Replay initiated. Previous status: ', $2::TEXT,
                                       '. Previous error: ', COALESCE($3::TEXT, 'none'))
            WHERE id = $1 AND processing_result = $2
            "#,
        )
        .bind(stored.id)
        .bind(&stored.processing_result)
        .bind(&stored.error_message)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::InvalidInput(format!(
                "webhook event {} changed state during replay",
                stored.id
            )));
        }
        Ok(())
    }

    /// Ids of failed events and of abandoned in-flight rows, oldest first.
    pub async fn failed_ids(&self, limit: i64) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM webhook_events
            WHERE processing_result = 'error'
               OR (processing_result IN ('processing', 'replaying')
                   AND processing_started_at < NOW() - ($2 || ' minutes')::INTERVAL)
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(PROCESSING_TIMEOUT_MINUTES.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn count_stuck(&self) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM webhook_events
            WHERE processing_result IN ('processing', 'replaying')
              AND processing_started_at < NOW() - ($1 || ' minutes')::INTERVAL
            "#,
        )
        .bind(PROCESSING_TIMEOUT_MINUTES.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete successful rows older than `keep_days`. Failed rows are kept for replay.
    pub async fn cleanup(&self, keep_days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_events
            WHERE processing_result = 'success'
              AND created_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(keep_days.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_result_names() {
        assert_eq!(ProcessingResult::Processing.as_str(), "processing");
        assert_eq!(ProcessingResult::Replaying.as_str(), "replaying");
        let json = serde_json::to_string(&ProcessingResult::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }

    async fn test_ledger() -> (WebhookLedger, PgPool) {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        (WebhookLedger::new(pool.clone()), pool)
    }

    async fn claim_new(ledger: &WebhookLedger, event_id: &str) -> ClaimResult {
        ledger
            .claim(
                PaymentProvider::FastSpring,
                event_id,
                "subscription.charge.failed",
                OffsetDateTime::now_utc(),
                &serde_json::json!({"id": event_id}),
            )
            .await
            .unwrap()
    }

    async fn age_row(pool: &PgPool, id: Uuid, status: &str, minutes: i32) {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2,
                processing_started_at = NOW() - ($3 || ' minutes')::INTERVAL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(minutes.to_string())
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL with migrations applied"]
    async fn test_redelivery_after_error_is_reclaimed() {
        let (ledger, _pool) = test_ledger().await;
        let event_id = format!("evt_{}", Uuid::new_v4());

        let ClaimResult::Claimed(id) = claim_new(&ledger, &event_id).await else {
            panic!("first delivery should claim");
        };
        ledger
            .finish(id, &Err(BillingError::Database("connection reset".into())))
            .await;

        assert_eq!(claim_new(&ledger, &event_id).await, ClaimResult::Claimed(id));
        let stored = ledger.load(id).await.unwrap();
        assert_eq!(stored.processing_result, "processing");
        assert!(stored.error_message.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL with migrations applied"]
    async fn test_successful_event_stays_duplicate() {
        let (ledger, _pool) = test_ledger().await;
        let event_id = format!("evt_{}", Uuid::new_v4());

        let ClaimResult::Claimed(id) = claim_new(&ledger, &event_id).await else {
            panic!("first delivery should claim");
        };
        ledger.finish(id, &Ok(())).await;

        assert_eq!(
            claim_new(&ledger, &event_id).await,
            ClaimResult::Duplicate {
                existing_status: Some("success".into())
            }
        );
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL with migrations applied"]
    async fn test_abandoned_replay_is_recovered() {
        let (ledger, pool) = test_ledger().await;
        let event_id = format!("evt_{}", Uuid::new_v4());
        let ClaimResult::Claimed(id) = claim_new(&ledger, &event_id).await else {
            panic!("first delivery should claim");
        };

        // A replay in flight is left alone.
        age_row(&pool, id, "replaying", 1).await;
        assert!(!ledger.failed_ids(10_000).await.unwrap().contains(&id));
        assert!(matches!(
            claim_new(&ledger, &event_id).await,
            ClaimResult::Duplicate { .. }
        ));

        // Past the timeout it is picked up by both paths.
        age_row(&pool, id, "replaying", PROCESSING_TIMEOUT_MINUTES + 1).await;
        assert!(ledger.failed_ids(10_000).await.unwrap().contains(&id));
        assert_eq!(claim_new(&ledger, &event_id).await, ClaimResult::Claimed(id));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL with migrations applied"]
    async fn test_replay_refuses_row_claimed_meanwhile() {
        let (ledger, _pool) = test_ledger().await;
        let event_id = format!("evt_{}", Uuid::new_v4());
        let ClaimResult::Claimed(id) = claim_new(&ledger, &event_id).await else {
            panic!("first delivery should claim");
        };
        ledger.finish(id, &Err(BillingError::Internal("boom".into()))).await;

        let stored = ledger.load(id).await.unwrap();
        assert_eq!(claim_new(&ledger, &event_id).await, ClaimResult::Claimed(id));
        assert!(ledger.mark_replaying(&stored).await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL with migrations applied"]
    async fn test_second_claim_is_duplicate() {
        let (ledger, _pool) = test_ledger().await;
        let event_id = format!("evt_{}", Uuid::new_v4());
        let payload = serde_json::json!({"id": event_id});
        let now = OffsetDateTime::now_utc();

        let first = ledger
            .claim(PaymentProvider::Stripe, &event_id, "invoice.paid", now, &payload)
            .await
            .unwrap();
        assert!(matches!(first, ClaimResult::Claimed(_)));

        let second = ledger
            .claim(PaymentProvider::Stripe, &event_id, "invoice.paid", now, &payload)
            .await
            .unwrap();
        assert_eq!(
            second,
            ClaimResult::Duplicate {
                existing_status: Some("processing".into())
            }
        );
    }
}
