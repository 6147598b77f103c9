//! Relational data model

pub mod payment;
pub mod test_result;
pub mod user;

pub use payment::PaymentProvider;
pub use test_result::{NewTestResult, TestKind, TestResult};
pub use user::{SubscriptionStatus, TransitionTrigger, User, UserRole};
