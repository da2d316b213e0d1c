//! Value objects carried by a saga record.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Reserved balance amount in the ledger's base currency.
///
/// Always finite and strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Amount(f64);

impl Amount {
    /// Validates and wraps a raw amount.
    pub fn new(value: f64) -> Result<Self, DomainError> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(DomainError::InvalidAmount(value))
        }
    }

    /// Returns the raw amount.
    pub fn as_f64(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Amount {
    type Error = DomainError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Amount::new(value)
    }
}

impl From<Amount> for f64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Version number of a saga record, used for optimistic concurrency control.
///
/// A freshly created saga is at version 1 and every committed write bumps it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of a newly created saga.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Operator attention marker. Flagged sagas are never picked up by the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaFlag {
    /// A step failed with a non-retryable error.
    ManualReview,

    /// The refund was recorded but the ledger credit is not confirmed.
    Reconciliation,
}

impl SagaFlag {
    /// Returns the flag name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaFlag::ManualReview => "ManualReview",
            SagaFlag::Reconciliation => "Reconciliation",
        }
    }
}

impl std::fmt::Display for SagaFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaFlag {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ManualReview" => Ok(SagaFlag::ManualReview),
            "Reconciliation" => Ok(SagaFlag::Reconciliation),
            other => Err(DomainError::UnknownFlag(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_rejects_non_positive_and_non_finite() {
        assert!(Amount::new(2.5).is_ok());
        assert_eq!(Amount::new(0.0), Err(DomainError::InvalidAmount(0.0)));
        assert!(Amount::new(-1.0).is_err());
        assert!(Amount::new(f64::NAN).is_err());
        assert!(Amount::new(f64::INFINITY).is_err());
    }

    #[test]
    fn amount_deserialization_validates() {
        let amount: Amount = serde_json::from_str("2.5").unwrap();
        assert_eq!(amount.as_f64(), 2.5);
        assert!(serde_json::from_str::<Amount>("-3").is_err());
    }

    #[test]
    fn version_increments() {
        assert_eq!(Version::first().next(), Version::new(2));
        assert!(Version::new(3) > Version::first());
    }

    #[test]
    fn flag_parses_from_display() {
        for flag in [SagaFlag::ManualReview, SagaFlag::Reconciliation] {
            assert_eq!(flag.to_string().parse::<SagaFlag>().unwrap(), flag);
        }
        assert!("Other".parse::<SagaFlag>().is_err());
    }
}
