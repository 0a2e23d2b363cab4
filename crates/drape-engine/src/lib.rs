//! Gem ledger and asynchronous try-on job pipeline.
//!
//! [`JobOrchestrator`] is the entry point: it validates a request, charges
//! gems through [`GemLedger`], drives the inference service to a terminal
//! state and refunds through [`ErrorClassifier`] when anything after the
//! charge fails.

pub mod auth;
pub mod classifier;
pub mod config;
pub mod error;
pub mod inference;
pub mod journal;
pub mod ledger;
pub mod object_store;
pub mod orchestrator;
pub mod prompt;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod validator;

pub use auth::{AuthError, Identity, IdentityProvider, StaticTokenProvider};
pub use classifier::{Charge, ErrorClassifier};
pub use config::EngineConfig;
pub use error::{ErrorKind, ErrorResponse, TryOnError};
pub use inference::{
    DryrunInference, InferenceError, InferenceRequest, InferenceService, Prediction,
    PredictionStatus, ReplicateClient,
};
pub use journal::JobJournal;
pub use ledger::{GemLedger, LedgerError};
pub use object_store::{LocalObjectStore, ObjectStore, ObjectStoreError};
pub use orchestrator::{
    build_inference, Collaborators, JobOrchestrator, TryOnRequest, TryOnResponse,
};
pub use rate_limit::{MemoryRateLimitStore, RateLimitDecision, RateLimitStore, RateLimiter};
pub use retry::{retry, RetryPolicy};
pub use store::{JobStore, JsonFileStore, LedgerStore, MemoryStore, StoreError};
pub use validator::{ImageError, ImageValidator, ValidatedImage};
