// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case tests for billing
//!
//! Boundary conditions across the lifecycle state machine, vendor payload
//! parsing and signature checks: reordered deliveries, retries, malformed
//! bodies and clock skew.

#[cfg(test)]
mod lifecycle_ordering_tests {
    use crate::lifecycle::{plan_transition, TransitionPlan};
    use mindscore_shared::{SubscriptionStatus::*, TransitionTrigger};
    use time::{Duration, OffsetDateTime};

    // =========================================================================
    // Renewal delivered after the cancel that superseded it
    // =========================================================================
    #[test]
    fn test_late_renewal_after_cancel_is_stale() {
        let canceled_at = OffsetDateTime::now_utc();
        let renewal_at = canceled_at - Duration::seconds(1);
        assert_eq!(
            plan_transition(Canceled, Some(canceled_at), Active, renewal_at, TransitionTrigger::Vendor),
            TransitionPlan::Stale
        );
    }

    // =========================================================================
    // Renewal newer than the cancel still cannot revive the old subscription
    // =========================================================================
    #[test]
    fn test_newer_renewal_cannot_leave_canceled() {
        let canceled_at = OffsetDateTime::now_utc();
        assert_eq!(
            plan_transition(
                Canceled,
                Some(canceled_at),
                Active,
                canceled_at + Duration::minutes(1),
                TransitionTrigger::Vendor
            ),
            TransitionPlan::Reject
        );
    }

    // =========================================================================
    // A fresh checkout is the only way back from canceled
    // =========================================================================
    #[test]
    fn test_checkout_reactivates_canceled_user() {
        assert!(Canceled.can_transition_to(Trial, TransitionTrigger::Checkout));
        assert!(Canceled.can_transition_to(Active, TransitionTrigger::Checkout));
        assert!(!Canceled.can_transition_to(Trial, TransitionTrigger::Admin));
        assert!(!Canceled.can_transition_to(PastDue, TransitionTrigger::Checkout));
    }

    // =========================================================================
    // Active never goes back to trial, whoever asks
    // =========================================================================
    #[test]
    fn test_active_cannot_return_to_trial() {
        for trigger in [TransitionTrigger::Vendor, TransitionTrigger::Admin, TransitionTrigger::Checkout] {
            assert!(!Active.can_transition_to(Trial, trigger));
        }
    }

    // =========================================================================
    // Retry of the event that set the status is a no-op, not a rejection
    // =========================================================================
    #[test]
    fn test_retry_with_identical_timestamp_is_unchanged() {
        let at = OffsetDateTime::now_utc();
        assert_eq!(
            plan_transition(PastDue, Some(at), PastDue, at, TransitionTrigger::Vendor),
            TransitionPlan::Unchanged
        );
    }

    // =========================================================================
    // Past-due users keep access while the vendor retries the card
    // =========================================================================
    #[test]
    fn test_access_gate() {
        assert!(Trial.grants_access());
        assert!(Active.grants_access());
        assert!(PastDue.grants_access());
        assert!(!Canceled.grants_access());
    }
}

#[cfg(test)]
mod provisioning_tests {
    use crate::provisioning::initial_status;
    use mindscore_shared::SubscriptionStatus;
    use time::{Duration, OffsetDateTime};

    // =========================================================================
    // Trial end exactly at the event time has already elapsed
    // =========================================================================
    #[test]
    fn test_trial_ending_at_event_time_starts_active() {
        let at = OffsetDateTime::now_utc();
        assert_eq!(initial_status(Some(at), 3, at), (SubscriptionStatus::Active, None));
    }

    #[test]
    fn test_one_day_trial() {
        let at = OffsetDateTime::now_utc();
        let (status, end) = initial_status(None, 1, at);
        assert_eq!(status, SubscriptionStatus::Trial);
        assert_eq!(end.map(|e| e - at), Some(Duration::days(1)));
    }
}

#[cfg(test)]
mod fastspring_tests {
    use crate::error::BillingError;
    use crate::fastspring::{sign_payload, FastSpringWebhookParser};
    use crate::lifecycle::PaymentEvent;
    use crate::webhooks::WebhookParser;
    use serde_json::json;

    fn parser() -> FastSpringWebhookParser {
        FastSpringWebhookParser::new("secret".into())
    }

    // =========================================================================
    // Empty batch is valid and acknowledges nothing
    // =========================================================================
    #[test]
    fn test_empty_batch() {
        let delivery = parser().parse(br#"{"events":[]}"#).unwrap();
        assert!(delivery.events.is_empty());
        assert!(delivery.rejected.is_empty());
    }

    // =========================================================================
    // Body without an events array is malformed
    // =========================================================================
    #[test]
    fn test_missing_events_array_is_malformed() {
        let err = parser().parse(br#"{"event":{}}"#).unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
    }

    // =========================================================================
    // Signature over different whitespace does not verify
    // =========================================================================
    #[test]
    fn test_signature_is_over_raw_bytes() {
        let sig = sign_payload("secret", br#"{"events":[]}"#).unwrap();
        assert!(parser().verify(br#"{ "events": [] }"#, &sig).is_err());
        assert!(parser().verify(br#"{"events":[]}"#, &format!(" {sig}\n")).is_ok());
    }

    // =========================================================================
    // Charge event without a subscription reference is ignored
    // =========================================================================
    #[test]
    fn test_charge_without_subscription_is_ignored() {
        let event = parser()
            .parse_stored(&json!({"id": "e1", "type": "subscription.charge.failed", "created": 0, "data": {}}))
            .unwrap();
        assert!(matches!(event.event, PaymentEvent::Ignored { .. }));
    }

    // =========================================================================
    // Expanded subscription object and bare id map the same way
    // =========================================================================
    #[test]
    fn test_expanded_and_bare_subscription_references() {
        let bare = parser()
            .parse_stored(&json!({"id": "e1", "type": "subscription.charge.completed", "created": 0,
                                  "data": {"subscription": "sub1", "total": 10}}))
            .unwrap();
        let expanded = parser()
            .parse_stored(&json!({"id": "e2", "type": "subscription.charge.completed", "created": 0,
                                  "data": {"subscription": {"id": "sub1"}, "total": 10}}))
            .unwrap();
        assert_eq!(bare.event, expanded.event);
    }
}

#[cfg(test)]
mod sipay_tests {
    use crate::error::BillingError;
    use crate::sipay::SipayWebhookParser;
    use crate::webhooks::WebhookParser;
    use serde_json::json;

    // =========================================================================
    // Notification retries without an event id deduplicate on payment+status
    // =========================================================================
    #[test]
    fn test_derived_event_id_is_stable() {
        let parser = SipayWebhookParser::new("s".into());
        let raw = json!({"status": "failed", "payment_id": "pay_1", "recurring_id": "rec_1"});
        let a = parser.parse_stored(&raw).unwrap();
        let b = parser.parse_stored(&raw).unwrap();
        assert_eq!(a.event_id, b.event_id);
        assert_eq!(a.event_id, "pay_1:failed");
    }

    #[test]
    fn test_notification_without_payment_id_is_malformed() {
        let parser = SipayWebhookParser::new("s".into());
        let err = parser.parse(br#"{"status":"paid"}"#).unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
    }
}

#[cfg(test)]
mod stripe_signature_tests {
    use crate::stripe_webhook::{verify_signature_manually, SIGNATURE_TOLERANCE_SECS};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn header(secret: &str, payload: &str, t: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{t}.{payload}").as_bytes());
        format!("t={t},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    // =========================================================================
    // Timestamp exactly at the tolerance edge is accepted, one past is not
    // =========================================================================
    #[test]
    fn test_tolerance_boundary() {
        let t = 1_700_000_000;
        let h = header("whsec_x", "{}", t);
        assert!(verify_signature_manually("{}", &h, "whsec_x", t + SIGNATURE_TOLERANCE_SECS).is_ok());
        assert!(verify_signature_manually("{}", &h, "whsec_x", t + SIGNATURE_TOLERANCE_SECS + 1).is_err());
    }

    // =========================================================================
    // Signature made in the future (clock skew) is allowed within tolerance
    // =========================================================================
    #[test]
    fn test_future_timestamp_within_tolerance() {
        let t = 1_700_000_000;
        let h = header("whsec_x", "{}", t);
        assert!(verify_signature_manually("{}", &h, "whsec_x", t - 60).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let t = 1_700_000_000;
        let h = header("whsec_other", "{}", t);
        assert!(verify_signature_manually("{}", &h, "whsec_x", t).is_err());
    }
}

#[cfg(test)]
mod refund_tests {
    use crate::refund::{resolve_amount, within_refund_window, REFUND_WINDOW_DAYS};
    use time::{Duration, OffsetDateTime};

    // =========================================================================
    // Refund of exactly the charged amount is allowed
    // =========================================================================
    #[test]
    fn test_refund_exact_amount() {
        assert_eq!(resolve_amount(Some(199), 199).unwrap(), 199);
    }

    // =========================================================================
    // One cent refunds are allowed
    // =========================================================================
    #[test]
    fn test_one_cent_refund() {
        assert_eq!(resolve_amount(Some(1), 199).unwrap(), 1);
    }

    #[test]
    fn test_window_boundary_inside_last_day() {
        let now = OffsetDateTime::now_utc();
        let created = now - Duration::days(REFUND_WINDOW_DAYS) - Duration::hours(23);
        assert!(within_refund_window(created, now));
    }
}
