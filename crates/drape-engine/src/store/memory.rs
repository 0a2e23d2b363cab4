use async_trait::async_trait;
use drape_contracts::{JobRecord, LedgerTransaction, NewTransaction, QualityTier, TransactionKind};
use tokio::sync::Mutex;

use super::{JobStore, LedgerStore, StoreDocument, StoreError};

/// Process-local store; the mutex makes every operation atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let mut document = StoreDocument::default();
        for (identity, balance) in accounts {
            document.balances.insert(identity.into(), balance);
        }
        Self {
            document: Mutex::new(document),
        }
    }

    pub async fn snapshot(&self) -> StoreDocument {
        self.document.lock().await.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn open_account(&self, identity: &str, initial_balance: u64) -> Result<u64, StoreError> {
        Ok(self
            .document
            .lock()
            .await
            .open_account(identity, initial_balance))
    }

    async fn balance(&self, identity: &str) -> Result<u64, StoreError> {
        Ok(self.document.lock().await.balance(identity))
    }

    async fn apply(&self, entry: NewTransaction) -> Result<LedgerTransaction, StoreError> {
        self.document.lock().await.apply(entry)
    }

    async fn find_transaction(
        &self,
        job_id: &str,
        kind: TransactionKind,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        Ok(self
            .document
            .lock()
            .await
            .find_transaction(job_id, kind)
            .cloned())
    }

    async fn transactions(&self, identity: &str) -> Result<Vec<LedgerTransaction>, StoreError> {
        Ok(self.document.lock().await.transactions(identity))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.document.lock().await.insert_job(record)
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.document.lock().await.update_job(record)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.document.lock().await.get_job(job_id))
    }

    async fn jobs_for(&self, identity: &str) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.document.lock().await.jobs_for(identity))
    }

    async fn find_cached(
        &self,
        identity: &str,
        cache_key: &str,
        tier: QualityTier,
    ) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .document
            .lock()
            .await
            .find_cached(identity, cache_key, tier))
    }
}
