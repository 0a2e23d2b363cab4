//! Data-store collaborators: balances, the transaction log and job history.
//!
//! Ledger mutations go through the single [`LedgerStore::apply`] primitive,
//! which checks funds, enforces one transaction per `(job_id, kind)`, moves the
//! balance and appends the log entry as one atomic step. Implementations must
//! never split that into a read in application code followed by a write.

mod document;
mod json_file;
mod memory;

use async_trait::async_trait;
use drape_contracts::{JobRecord, LedgerTransaction, NewTransaction, QualityTier, TransactionKind};
use thiserror::Error;

use crate::error::{ErrorKind, TryOnError};

pub use document::StoreDocument;
pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: u64, requested: u64 },
    #[error("{kind} already recorded for job {job_id}")]
    DuplicateTransaction { job_id: String, kind: TransactionKind },
    #[error("balance overflow for {0}")]
    Overflow(String),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {0} already exists")]
    JobExists(String),
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store document is invalid: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for TryOnError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientFunds { .. } => {
                TryOnError::new(ErrorKind::InsufficientFunds, err.to_string())
            }
            _ => TryOnError::new(ErrorKind::DatabaseError, err.to_string()),
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates the account with `initial_balance` unless it already exists.
    /// Returns the account's balance either way.
    async fn open_account(&self, identity: &str, initial_balance: u64) -> Result<u64, StoreError>;

    /// Current balance; identities without an account hold zero gems.
    async fn balance(&self, identity: &str) -> Result<u64, StoreError>;

    async fn apply(&self, entry: NewTransaction) -> Result<LedgerTransaction, StoreError>;

    async fn find_transaction(
        &self,
        job_id: &str,
        kind: TransactionKind,
    ) -> Result<Option<LedgerTransaction>, StoreError>;

    /// Oldest first.
    async fn transactions(&self, identity: &str) -> Result<Vec<LedgerTransaction>, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError>;

    async fn update_job(&self, record: &JobRecord) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Newest first.
    async fn jobs_for(&self, identity: &str) -> Result<Vec<JobRecord>, StoreError>;

    /// Most recent completed job of `identity` answering `cache_key` at `tier`.
    async fn find_cached(
        &self,
        identity: &str,
        cache_key: &str,
        tier: QualityTier,
    ) -> Result<Option<JobRecord>, StoreError>;
}
