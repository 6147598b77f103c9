//! Users and their subscription state

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};
use time::OffsetDateTime;
use uuid::Uuid;

use super::payment::PaymentProvider;
use crate::error::{SharedError, SharedResult};

/// Subscription state stored on the user row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Canceled,
    PastDue,
}

/// What caused a status change. Only a completed checkout may leave `canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTrigger {
    Checkout,
    Vendor,
    Admin,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }

    /// Whether gated result details are visible. `past_due` keeps access
    /// while the vendor retries the charge.
    pub fn grants_access(&self) -> bool {
        !matches!(self, SubscriptionStatus::Canceled)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    /// Staying in the same status is not a transition and returns false.
    pub fn can_transition_to(&self, next: SubscriptionStatus, trigger: TransitionTrigger) -> bool {
        use SubscriptionStatus::*;

        match (self, next) {
            (Trial, Active | PastDue | Canceled) => true,
            (Active, PastDue | Canceled) => true,
            (PastDue, Active | Canceled) => true,
            (Canceled, Trial | Active) => trigger == TransitionTrigger::Checkout,
            _ => false,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            other => Err(SharedError::UnknownVariant {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for SubscriptionStatus {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
        }
    }
}

impl TryFrom<String> for UserRole {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "user" => Ok(UserRole::User),
            "admin" => Ok(UserRole::Admin),
            _ => Err(SharedError::UnknownVariant {
                kind: "user role",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub user_name: Option<String>,
    pub iq: Option<i32>,
    #[sqlx(try_from = "String")]
    pub subscription_status: SubscriptionStatus,
    #[sqlx(try_from = "String")]
    pub role: UserRole,
    pub payment_provider: Option<String>,
    pub subscription_id: Option<String>,
    pub customer_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub status_changed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

const USER_COLUMNS: &str = r#"
    id, email, password_hash, user_name, iq, subscription_status, role,
    payment_provider, subscription_id, customer_ref, trial_end_date,
    status_changed_at, created_at, updated_at
"#;

impl User {
    pub fn provider(&self) -> Option<PaymentProvider> {
        self.payment_provider.as_deref().and_then(|p| p.parse().ok())
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> SharedResult<Option<User>>
    where
        E: PgExecutor<'e>,
    {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await?;
        Ok(user)
    }

    /// Email lookup is case-insensitive, matching the unique index.
    pub async fn find_by_email<'e, E>(executor: E, email: &str) -> SharedResult<Option<User>>
    where
        E: PgExecutor<'e>,
    {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email.trim())
            .fetch_optional(executor)
            .await?;
        Ok(user)
    }

    pub async fn find_by_subscription<'e, E>(
        executor: E,
        provider: PaymentProvider,
        subscription_id: &str,
    ) -> SharedResult<Option<User>>
    where
        E: PgExecutor<'e>,
    {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE payment_provider = $1 AND subscription_id = $2 \
             ORDER BY updated_at DESC LIMIT 1"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(provider.as_str())
            .bind(subscription_id)
            .fetch_optional(executor)
            .await?;
        Ok(user)
    }

    pub async fn find_by_customer<'e, E>(
        executor: E,
        provider: PaymentProvider,
        customer_ref: &str,
    ) -> SharedResult<Option<User>>
    where
        E: PgExecutor<'e>,
    {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE payment_provider = $1 AND customer_ref = $2 \
             ORDER BY updated_at DESC LIMIT 1"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(provider.as_str())
            .bind(customer_ref)
            .fetch_optional(executor)
            .await?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn test_status_round_trips_through_column_text() {
        for status in [Trial, Active, Canceled, PastDue] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert!("trialing".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_access_gate() {
        assert!(Trial.grants_access());
        assert!(Active.grants_access());
        assert!(PastDue.grants_access());
        assert!(!Canceled.grants_access());
    }

    #[test]
    fn test_trial_moves_forward() {
        let t = TransitionTrigger::Vendor;
        assert!(Trial.can_transition_to(Active, t));
        assert!(Trial.can_transition_to(PastDue, t));
        assert!(Trial.can_transition_to(Canceled, t));
    }

    #[test]
    fn test_active_never_returns_to_trial() {
        assert!(!Active.can_transition_to(Trial, TransitionTrigger::Vendor));
        assert!(!Active.can_transition_to(Trial, TransitionTrigger::Checkout));
    }

    #[test]
    fn test_past_due_recovers_or_cancels() {
        let t = TransitionTrigger::Vendor;
        assert!(PastDue.can_transition_to(Active, t));
        assert!(PastDue.can_transition_to(Canceled, t));
        assert!(!PastDue.can_transition_to(Trial, t));
    }

    #[test]
    fn test_canceled_only_reopens_through_checkout() {
        assert!(!Canceled.can_transition_to(Active, TransitionTrigger::Vendor));
        assert!(!Canceled.can_transition_to(Active, TransitionTrigger::Admin));
        assert!(Canceled.can_transition_to(Active, TransitionTrigger::Checkout));
        assert!(Canceled.can_transition_to(Trial, TransitionTrigger::Checkout));
        assert!(!Canceled.can_transition_to(PastDue, TransitionTrigger::Checkout));
    }

    #[test]
    fn test_same_status_is_not_a_transition() {
        for status in [Trial, Active, Canceled, PastDue] {
            assert!(!status.can_transition_to(status, TransitionTrigger::Checkout));
        }
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(UserRole::try_from("admin".to_string()).unwrap(), UserRole::Admin);
        assert!(UserRole::try_from("superadmin".to_string()).is_err());
    }
}
