//! Balance ledger trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::ProfileId;
use domain::Amount;

use super::ServiceError;

/// Trait for the user balance ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Credits `amount` to the profile's balance.
    ///
    /// Not idempotent: every successful call moves money.
    async fn credit(&self, profile_id: ProfileId, amount: Amount) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryLedgerState {
    balances: HashMap<ProfileId, f64>,
    credits: Vec<(ProfileId, Amount)>,
    transient_failures: usize,
    fail_permanently: bool,
}

/// In-memory ledger for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<InMemoryLedgerState>>,
}

impl InMemoryLedger {
    /// Creates a new in-memory ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` credit calls fail transiently.
    pub fn fail_next_credits(&self, count: usize) {
        self.state.write().unwrap().transient_failures = count;
    }

    /// Configures every credit call to fail permanently.
    pub fn set_fail_permanently(&self, fail: bool) {
        self.state.write().unwrap().fail_permanently = fail;
    }

    /// Returns the current balance of a profile.
    pub fn balance(&self, profile_id: ProfileId) -> f64 {
        self.state
            .read()
            .unwrap()
            .balances
            .get(&profile_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Returns how many credits were applied to a profile.
    pub fn credit_count(&self, profile_id: ProfileId) -> usize {
        self.state
            .read()
            .unwrap()
            .credits
            .iter()
            .filter(|(profile, _)| *profile == profile_id)
            .count()
    }

    /// Returns every applied credit in order.
    pub fn credits(&self) -> Vec<(ProfileId, Amount)> {
        self.state.read().unwrap().credits.clone()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn credit(&self, profile_id: ProfileId, amount: Amount) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap();

        if state.fail_permanently {
            return Err(ServiceError::Permanent("ledger rejected credit".to_string()));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ServiceError::Transient("ledger timeout".to_string()));
        }

        *state.balances.entry(profile_id).or_default() += amount.as_f64();
        state.credits.push((profile_id, amount));
        tracing::debug!(%profile_id, %amount, "balance credited");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_credit_accumulates() {
        let ledger = InMemoryLedger::new();
        let profile = ProfileId::new(42);

        ledger.credit(profile, Amount::new(2.5).unwrap()).await.unwrap();
        ledger.credit(profile, Amount::new(1.0).unwrap()).await.unwrap();

        assert_eq!(ledger.balance(profile), 3.5);
        assert_eq!(ledger.credit_count(profile), 2);
        assert_eq!(ledger.balance(ProfileId::new(7)), 0.0);
    }

    #[tokio::test]
    async fn test_transient_failures_run_out() {
        let ledger = InMemoryLedger::new();
        let profile = ProfileId::new(42);
        ledger.fail_next_credits(1);

        let first = ledger.credit(profile, Amount::new(2.5).unwrap()).await;
        assert!(matches!(first, Err(ServiceError::Transient(_))));
        assert_eq!(ledger.credit_count(profile), 0);

        ledger.credit(profile, Amount::new(2.5).unwrap()).await.unwrap();
        assert_eq!(ledger.credit_count(profile), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure() {
        let ledger = InMemoryLedger::new();
        ledger.set_fail_permanently(true);

        let result = ledger
            .credit(ProfileId::new(42), Amount::new(2.5).unwrap())
            .await;
        assert!(matches!(result, Err(ServiceError::Permanent(_))));
        assert!(ledger.credits().is_empty());
    }
}
