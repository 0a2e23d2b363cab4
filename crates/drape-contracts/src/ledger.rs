use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deduction,
    Refund,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deduction => "deduction",
            Self::Refund => "refund",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger mutation that has not been applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub identity: String,
    pub amount: u64,
    pub kind: TransactionKind,
    pub job_id: String,
}

impl NewTransaction {
    pub fn deduction(identity: impl Into<String>, amount: u64, job_id: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            amount,
            kind: TransactionKind::Deduction,
            job_id: job_id.into(),
        }
    }

    pub fn refund(identity: impl Into<String>, amount: u64, job_id: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            amount,
            kind: TransactionKind::Refund,
            job_id: job_id.into(),
        }
    }

    /// Signed balance delta: negative for deductions, positive for refunds.
    pub fn signed_amount(&self) -> i64 {
        let amount = i64::try_from(self.amount).unwrap_or(i64::MAX);
        match self.kind {
            TransactionKind::Deduction => -amount,
            TransactionKind::Refund => amount,
        }
    }

    pub fn into_record(self, balance_after: u64) -> LedgerTransaction {
        LedgerTransaction {
            amount: self.signed_amount(),
            identity: self.identity,
            kind: self.kind,
            job_id: self.job_id,
            balance_after,
            created_at: Utc::now(),
        }
    }
}

/// Immutable log entry written together with the balance change it records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub identity: String,
    pub amount: i64,
    pub kind: TransactionKind,
    pub job_id: String,
    pub balance_after: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_amount_follows_kind() {
        assert_eq!(NewTransaction::deduction("u", 3, "j").signed_amount(), -3);
        assert_eq!(NewTransaction::refund("u", 3, "j").signed_amount(), 3);
    }

    #[test]
    fn record_carries_balance_after() {
        let record = NewTransaction::deduction("u", 2, "job-9").into_record(8);
        assert_eq!(record.amount, -2);
        assert_eq!(record.balance_after, 8);
        assert_eq!(record.kind.as_str(), "deduction");
        assert_eq!(record.job_id, "job-9");
    }
}
