//! Shared data contracts for the drape try-on pipeline.
//!
//! Everything here is plain data plus pure helpers: quality tiers and their
//! generation parameters, clothing items and their category ordering, job and
//! ledger records, the request cache key, and the JSONL job-event writer.

pub mod events;
pub mod jobs;
pub mod ledger;
pub mod tiers;

pub use jobs::cache_key::{content_digest, derive_cache_key};
pub use jobs::clothing::{sort_by_category, ClothingCategory, ClothingItem};
pub use jobs::record::{JobInputs, JobRecord, JobStatus};
pub use ledger::{LedgerTransaction, NewTransaction, TransactionKind};
pub use tiers::{GenerationParams, QualityTier};
