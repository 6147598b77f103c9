use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SharedError;

/// Payment vendor that owns a user's subscription reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Stripe,
    FastSpring,
    Sipay,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::FastSpring => "fastspring",
            PaymentProvider::Sipay => "sipay",
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentProvider {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stripe" => Ok(PaymentProvider::Stripe),
            "fastspring" => Ok(PaymentProvider::FastSpring),
            "sipay" => Ok(PaymentProvider::Sipay),
            other => Err(SharedError::UnknownVariant {
                kind: "payment provider",
                value: other.to_string(),
            }),
        }
    }
}
