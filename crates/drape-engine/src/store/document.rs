use std::collections::BTreeMap;

use drape_contracts::{JobRecord, LedgerTransaction, NewTransaction, QualityTier, TransactionKind};
use serde::{Deserialize, Serialize};

use super::StoreError;

/// The three logical tables, held as one serializable document.
///
/// Every mutation here is validated in full before anything is written, so a
/// rejected operation leaves the document untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub balances: BTreeMap<String, u64>,
    #[serde(default)]
    pub transactions: Vec<LedgerTransaction>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobRecord>,
}

impl StoreDocument {
    pub fn open_account(&mut self, identity: &str, initial_balance: u64) -> u64 {
        *self
            .balances
            .entry(identity.to_string())
            .or_insert(initial_balance)
    }

    pub fn balance(&self, identity: &str) -> u64 {
        self.balances.get(identity).copied().unwrap_or(0)
    }

    pub fn apply(&mut self, entry: NewTransaction) -> Result<LedgerTransaction, StoreError> {
        if self.find_transaction(&entry.job_id, entry.kind).is_some() {
            return Err(StoreError::DuplicateTransaction {
                job_id: entry.job_id,
                kind: entry.kind,
            });
        }
        let balance = self.balance(&entry.identity);
        let next = match entry.kind {
            TransactionKind::Deduction => {
                balance
                    .checked_sub(entry.amount)
                    .ok_or(StoreError::InsufficientFunds {
                        balance,
                        requested: entry.amount,
                    })?
            }
            TransactionKind::Refund => balance
                .checked_add(entry.amount)
                .ok_or_else(|| StoreError::Overflow(entry.identity.clone()))?,
        };
        self.balances.insert(entry.identity.clone(), next);
        let record = entry.into_record(next);
        self.transactions.push(record.clone());
        Ok(record)
    }

    pub fn find_transaction(
        &self,
        job_id: &str,
        kind: TransactionKind,
    ) -> Option<&LedgerTransaction> {
        self.transactions
            .iter()
            .find(|row| row.job_id == job_id && row.kind == kind)
    }

    pub fn transactions(&self, identity: &str) -> Vec<LedgerTransaction> {
        self.transactions
            .iter()
            .filter(|row| row.identity == identity)
            .cloned()
            .collect()
    }

    pub fn insert_job(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        if self.jobs.contains_key(&record.job_id) {
            return Err(StoreError::JobExists(record.job_id.clone()));
        }
        self.jobs.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    pub fn update_job(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let Some(existing) = self.jobs.get_mut(&record.job_id) else {
            return Err(StoreError::JobNotFound(record.job_id.clone()));
        };
        *existing = record.clone();
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.get(job_id).cloned()
    }

    pub fn jobs_for(&self, identity: &str) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .values()
            .filter(|job| job.identity == identity)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn find_cached(
        &self,
        identity: &str,
        cache_key: &str,
        tier: QualityTier,
    ) -> Option<JobRecord> {
        self.jobs
            .values()
            .filter(|job| job.identity == identity && job.serves_cache_hit(cache_key, tier))
            .max_by_key(|job| job.created_at)
            .cloned()
    }
}
