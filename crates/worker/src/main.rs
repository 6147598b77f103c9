//! MindScore Background Worker
//!
//! Handles scheduled jobs including:
//! - Billing invariant checks (hourly)
//! - Stale Stripe trial reconciliation (every 30 minutes)
//! - Failed webhook replay (every 15 minutes)
//! - Webhook ledger cleanup (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use mindscore_billing::{
    BillingError, BillingService, InvariantCheckSummary, WebhookReplayResult,
};
use mindscore_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_PUBLIC_URL: &str = "http://localhost:3000";
const STALE_TRIAL_BATCH: i64 = 100;
const REPLAY_BATCH: i64 = 50;
const LEDGER_KEEP_DAYS: i32 = 30;

/// Log results of an invariant run
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants healthy");
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        worst = ?summary.worst_severity(),
        "Billing invariant violations found"
    );
    for violation in &summary.violations {
        error!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            users = violation.user_ids.len(),
            "{}",
            violation.description
        );
    }
}

/// `(succeeded, failed)` for a replay batch
fn replay_counts(results: &[WebhookReplayResult]) -> (usize, usize) {
    let succeeded = results.iter().filter(|r| r.success).count();
    (succeeded, results.len() - succeeded)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,mindscore_billing=debug")),
        )
        .init();

    info!("Starting MindScore Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let public_url =
        std::env::var("PUBLIC_URL").unwrap_or_else(|_| DEFAULT_PUBLIC_URL.to_string());

    let billing = match BillingService::from_env(pool.clone(), &public_url) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Keep running with minimal functionality
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing invariants (hourly, on the hour)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (hourly)");

    // Job 2: Trials whose end date passed without a webhook moving them
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */30 * * * *", move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                match billing
                    .subscriptions
                    .reconcile_stale_trials(STALE_TRIAL_BATCH)
                    .await
                {
                    Ok(summary) => info!(
                        checked = summary.checked,
                        changed = summary.changed,
                        failed = summary.failed,
                        "Stale trial reconciliation complete"
                    ),
                    Err(BillingError::ProviderNotConfigured(_)) => {
                        tracing::debug!("Stripe not configured, skipping trial reconciliation")
                    }
                    Err(e) => error!(error = %e, "Stale trial reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale trial reconciliation (every 30 minutes)");

    // Job 3: Replay failed webhook events
    let replay_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                match billing.webhooks.replay_all_failed(Some(REPLAY_BATCH)).await {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => {
                        let (succeeded, failed) = replay_counts(&results);
                        info!(succeeded, failed, "Failed webhook replay complete");
                        for r in results.iter().filter(|r| !r.success) {
                            warn!(
                                provider = %r.provider,
                                event_id = %r.event_id,
                                error = ?r.new_error,
                                "Webhook replay still failing"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Failed webhook replay errored"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed webhook replay (every 15 minutes)");

    // Job 4: Webhook ledger cleanup (3:00 AM UTC)
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                match billing.webhooks.ledger().cleanup(LEDGER_KEEP_DAYS).await {
                    Ok(deleted) => info!(deleted, keep_days = LEDGER_KEEP_DAYS, "Webhook ledger cleanup complete"),
                    Err(e) => error!(error = %e, "Webhook ledger cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook ledger cleanup (3:00 AM UTC)");

    // Job 5: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("MindScore Worker started successfully with {} scheduled jobs", 5);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(success: bool) -> WebhookReplayResult {
        WebhookReplayResult {
            record_id: uuid::Uuid::new_v4(),
            provider: "fastspring".into(),
            event_id: "evt".into(),
            event_type: "subscription.charge.failed".into(),
            previous_status: "error".into(),
            previous_error: Some("db timeout".into()),
            new_status: if success { "success" } else { "error" }.into(),
            new_error: None,
            success,
        }
    }

    #[test]
    fn test_replay_counts() {
        let results = vec![replay(true), replay(false), replay(true)];
        assert_eq!(replay_counts(&results), (2, 1));
        assert_eq!(replay_counts(&[]), (0, 0));
    }
}
