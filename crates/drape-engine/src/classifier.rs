use serde_json::json;

use crate::error::{ErrorKind, ErrorResponse, TryOnError};
use crate::journal::JobJournal;
use crate::ledger::GemLedger;

const REFUNDED_SUFFIX: &str = " Your gems have been refunded.";

/// Gems held against a job between reservation and completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub identity: String,
    pub job_id: String,
    pub amount: u64,
}

/// Single exit point for pipeline failures.
///
/// Every failure leaves the orchestrator through [`ErrorClassifier::handle`],
/// which refunds refunding kinds exactly once when a charge is outstanding
/// and renders the user-facing response. A refund that itself fails is
/// logged and journaled; the caller still sees the original failure.
#[derive(Clone)]
pub struct ErrorClassifier {
    ledger: GemLedger,
    journal: JobJournal,
}

impl ErrorClassifier {
    pub fn new(ledger: GemLedger, journal: JobJournal) -> Self {
        Self { ledger, journal }
    }

    pub fn classify(&self, err: &TryOnError) -> ErrorKind {
        err.kind
    }

    pub async fn handle(&self, err: &TryOnError, charge: Option<&Charge>) -> ErrorResponse {
        let kind = self.classify(err);
        let refunded = match charge {
            Some(charge) if kind.should_refund() && charge.amount > 0 => {
                self.refund(kind, charge).await
            }
            _ => false,
        };

        if kind.is_client_fault() {
            tracing::info!(kind = %kind, detail = %err.detail, "request rejected");
        } else {
            tracing::warn!(kind = %kind, detail = %err.detail, refunded, "job failed");
        }

        let mut user_message = kind.user_message().to_string();
        if refunded {
            user_message.push_str(REFUNDED_SUFFIX);
        }
        ErrorResponse {
            error_kind: kind,
            user_message,
            status: err.status(),
            retry_after_ms: err
                .retry_after
                .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
            refunded,
        }
    }

    async fn refund(&self, kind: ErrorKind, charge: &Charge) -> bool {
        // an earlier pass already paid this job back; nothing new to journal
        if let Ok(true) = self.ledger.was_refunded(&charge.job_id).await {
            return true;
        }
        match self
            .ledger
            .release(&charge.identity, charge.amount, &charge.job_id)
            .await
        {
            Ok(balance) => {
                self.journal.record(
                    "gems_refunded",
                    &charge.job_id,
                    json!({
                        "identity": charge.identity,
                        "amount": charge.amount,
                        "balance": balance,
                        "error_kind": kind.as_str(),
                    }),
                );
                true
            }
            Err(refund_err) => {
                tracing::error!(
                    identity = %charge.identity,
                    job_id = %charge.job_id,
                    amount = charge.amount,
                    kind = %kind,
                    error = %refund_err,
                    "refund failed; manual follow-up required"
                );
                self.journal.record(
                    "refund_failed",
                    &charge.job_id,
                    json!({
                        "identity": charge.identity,
                        "amount": charge.amount,
                        "error_kind": kind.as_str(),
                        "refund_error": refund_err.to_string(),
                    }),
                );
                false
            }
        }
    }
}
