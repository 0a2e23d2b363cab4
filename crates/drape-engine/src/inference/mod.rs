//! Asynchronous prediction services.

mod dryrun;
mod replicate;

use async_trait::async_trait;
use drape_contracts::GenerationParams;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{ErrorKind, TryOnError};
use crate::retry::{is_transient_message, AttemptTimedOut};

pub use dryrun::DryrunInference;
pub use replicate::ReplicateClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    /// Unknown statuses are treated as still running; the poll ceiling bounds them.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "starting" | "queued" => Self::Starting,
            "succeeded" | "successful" | "completed" => Self::Succeeded,
            "failed" | "error" => Self::Failed,
            "canceled" | "cancelled" | "aborted" => Self::Canceled,
            _ => Self::Processing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl Prediction {
    /// First output reference, whether the service returned one or a list.
    pub fn result_reference(&self) -> Option<String> {
        let output = self.output.as_ref()?;
        let mut urls = Vec::new();
        extract_output_urls(output, &mut urls);
        urls.into_iter().next()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub params: GenerationParams,
    /// Person/base image first, then garments in prompt order.
    pub image_urls: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{service} request failed ({status}): {body}")]
    Http {
        service: String,
        status: u16,
        body: String,
    },
    #[error("{service} transport failed: {message}")]
    Transport {
        service: String,
        message: String,
        retryable: bool,
    },
    #[error("{service} returned an invalid payload: {message}")]
    InvalidPayload { service: String, message: String },
    #[error("inference service misconfigured: {0}")]
    Misconfigured(String),
    #[error("inference output could not be written: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Timeout(#[from] AttemptTimedOut),
}

impl From<InferenceError> for TryOnError {
    fn from(err: InferenceError) -> Self {
        TryOnError::new(ErrorKind::ProcessingFailed, err.to_string())
    }
}

/// Retry predicate for inference calls: transient transport failures, 5xx
/// and 429 are retried; every other 4xx is final.
pub fn is_retryable_inference_error(err: &InferenceError) -> bool {
    match err {
        InferenceError::Http { status, .. } => *status == 429 || *status >= 500,
        InferenceError::Transport {
            retryable, message, ..
        } => *retryable || is_transient_message(message),
        InferenceError::Timeout(_) => true,
        InferenceError::InvalidPayload { .. }
        | InferenceError::Misconfigured(_)
        | InferenceError::Io(_) => false,
    }
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    fn name(&self) -> &str;
    async fn submit(&self, request: &InferenceRequest) -> Result<Prediction, InferenceError>;
    async fn poll(&self, prediction_id: &str) -> Result<Prediction, InferenceError>;
}

fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty() && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            if let Some(url) = obj.get("url") {
                extract_output_urls(url, out);
            }
            if let Some(urls) = obj.get("urls") {
                extract_output_urls(urls, out);
            }
            if let Some(output) = obj.get("output") {
                extract_output_urls(output, out);
            }
        }
        _ => {}
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn prediction(output: Value) -> Prediction {
        Prediction {
            id: "p-1".to_string(),
            status: PredictionStatus::Succeeded,
            output: Some(output),
            error: None,
        }
    }

    #[test]
    fn result_reference_handles_single_and_list() {
        assert_eq!(
            prediction(json!("https://x/1.png")).result_reference().as_deref(),
            Some("https://x/1.png")
        );
        assert_eq!(
            prediction(json!(["https://x/a.png", "https://x/b.png"]))
                .result_reference()
                .as_deref(),
            Some("https://x/a.png")
        );
        assert_eq!(
            prediction(json!({"output": [{"url": "https://x/c.png"}]}))
                .result_reference()
                .as_deref(),
            Some("https://x/c.png")
        );
        assert_eq!(prediction(json!([])).result_reference(), None);
        assert_eq!(prediction(json!(null)).result_reference(), None);
    }

    #[test]
    fn inference_retry_predicate_follows_status_class() {
        let http = |status| InferenceError::Http {
            service: "replicate".to_string(),
            status,
            body: String::new(),
        };
        assert!(is_retryable_inference_error(&http(500)));
        assert!(is_retryable_inference_error(&http(503)));
        assert!(is_retryable_inference_error(&http(429)));
        assert!(!is_retryable_inference_error(&http(400)));
        assert!(!is_retryable_inference_error(&http(401)));
        assert!(!is_retryable_inference_error(&http(422)));
        assert!(is_retryable_inference_error(&InferenceError::Timeout(
            AttemptTimedOut(std::time::Duration::from_secs(1))
        )));
    }

    #[test]
    fn body_read_resets_are_retried() {
        let transport = |message: &str| InferenceError::Transport {
            service: "replicate".to_string(),
            message: message.to_string(),
            retryable: false,
        };
        assert!(is_retryable_inference_error(&transport(
            "error decoding response body: connection reset by peer"
        )));
        assert!(!is_retryable_inference_error(&transport(
            "builder error: relative URL without a base"
        )));
    }

    #[test]
    fn status_parsing_is_lenient() {
        assert_eq!(PredictionStatus::parse("SUCCEEDED"), PredictionStatus::Succeeded);
        assert_eq!(PredictionStatus::parse("cancelled"), PredictionStatus::Canceled);
        assert_eq!(PredictionStatus::parse("warming"), PredictionStatus::Processing);
        assert!(!PredictionStatus::Starting.is_terminal());
        assert!(PredictionStatus::Failed.is_terminal());
    }
}
