use std::sync::Arc;

use drape_contracts::{LedgerTransaction, NewTransaction, TransactionKind};
use thiserror::Error;

use crate::error::{ErrorKind, TryOnError};
use crate::store::{LedgerStore, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: u64, requested: u64 },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientFunds { balance, requested } => {
                Self::InsufficientFunds { balance, requested }
            }
            other => Self::Store(other),
        }
    }
}

impl From<LedgerError> for TryOnError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { .. } => {
                TryOnError::new(ErrorKind::InsufficientFunds, err.to_string())
            }
            LedgerError::Store(inner) => TryOnError::from(inner),
        }
    }
}

/// Gem balance operations.
///
/// Both operations are a single atomic store call. A second deduction or
/// refund for the same job id is a no-op that reports the current balance,
/// so retried reservations never double-charge and a refund can only land
/// once per job.
///
/// The ledger is built on a service-credentialed store handle and does not
/// depend on the caller's session, so a refund still applies after the user's
/// token has expired mid-job.
#[derive(Clone)]
pub struct GemLedger {
    store: Arc<dyn LedgerStore>,
}

impl GemLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn balance(&self, identity: &str) -> Result<u64, LedgerError> {
        Ok(self.store.balance(identity).await?)
    }

    pub async fn open_account(
        &self,
        identity: &str,
        initial_balance: u64,
    ) -> Result<u64, LedgerError> {
        Ok(self.store.open_account(identity, initial_balance).await?)
    }

    pub async fn transactions(
        &self,
        identity: &str,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        Ok(self.store.transactions(identity).await?)
    }

    /// Deducts `amount` for `job_id`; returns the new balance.
    pub async fn reserve(
        &self,
        identity: &str,
        amount: u64,
        job_id: &str,
    ) -> Result<u64, LedgerError> {
        self.apply(NewTransaction::deduction(identity, amount, job_id))
            .await
    }

    /// Refunds `amount` for `job_id`; returns the new balance.
    pub async fn release(
        &self,
        identity: &str,
        amount: u64,
        job_id: &str,
    ) -> Result<u64, LedgerError> {
        self.apply(NewTransaction::refund(identity, amount, job_id))
            .await
    }

    async fn apply(&self, entry: NewTransaction) -> Result<u64, LedgerError> {
        let identity = entry.identity.clone();
        let kind = entry.kind;
        let amount = entry.amount;
        match self.store.apply(entry).await {
            Ok(record) => {
                tracing::info!(
                    identity = %identity,
                    job_id = %record.job_id,
                    kind = %kind,
                    amount,
                    balance = record.balance_after,
                    "ledger transaction applied"
                );
                Ok(record.balance_after)
            }
            Err(StoreError::DuplicateTransaction { job_id, kind }) => {
                tracing::warn!(
                    identity = %identity,
                    job_id = %job_id,
                    kind = %kind,
                    "ledger transaction already recorded; skipping"
                );
                Ok(self.store.balance(&identity).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn was_refunded(&self, job_id: &str) -> Result<bool, LedgerError> {
        Ok(self
            .store
            .find_transaction(job_id, TransactionKind::Refund)
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::store::MemoryStore;

    use super::*;

    fn ledger_with(balance: u64) -> (GemLedger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_accounts([("alice", balance)]));
        (GemLedger::new(store.clone()), store)
    }

    #[tokio::test]
    async fn reserve_and_release_are_logged() -> anyhow::Result<()> {
        let (ledger, _) = ledger_with(5);
        assert_eq!(ledger.reserve("alice", 2, "job-1").await?, 3);
        assert_eq!(ledger.release("alice", 2, "job-1").await?, 5);

        let rows = ledger.transactions("alice").await?;
        let kinds: Vec<TransactionKind> = rows.iter().map(|row| row.kind).collect();
        assert_eq!(kinds, [TransactionKind::Deduction, TransactionKind::Refund]);
        assert!(rows.iter().all(|row| row.job_id == "job-1"));
        assert!(ledger.was_refunded("job-1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn reserve_rejects_overdraft() -> anyhow::Result<()> {
        let (ledger, _) = ledger_with(1);
        let err = ledger.reserve("alice", 2, "job-1").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                balance: 1,
                requested: 2
            }
        ));
        assert_eq!(TryOnError::from(err).kind, ErrorKind::InsufficientFunds);
        assert_eq!(ledger.balance("alice").await?, 1);
        assert!(ledger.transactions("alice").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn repeated_refund_for_a_job_is_a_no_op() -> anyhow::Result<()> {
        let (ledger, _) = ledger_with(3);
        ledger.reserve("alice", 1, "job-1").await?;
        assert_eq!(ledger.release("alice", 1, "job-1").await?, 3);
        assert_eq!(ledger.release("alice", 1, "job-1").await?, 3);
        assert_eq!(ledger.reserve("alice", 1, "job-1").await?, 3);
        assert_eq!(ledger.transactions("alice").await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_reserves_never_overdraw() -> anyhow::Result<()> {
        let (ledger, _) = ledger_with(10);
        let mut handles = Vec::new();
        for idx in 0..25 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.reserve("alice", 1, &format!("job-{idx}")).await
            }));
        }
        let mut succeeded = 0;
        for handle in handles {
            if handle.await?.is_ok() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 10);
        assert_eq!(ledger.balance("alice").await?, 0);
        let logged: i64 = ledger
            .transactions("alice")
            .await?
            .iter()
            .map(|row| row.amount)
            .sum();
        assert_eq!(logged, -10);
        Ok(())
    }
}
