use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{InferenceError, InferenceRequest, InferenceService, Prediction, PredictionStatus};

const SERVICE: &str = "dryrun";
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Offline stand-in for a prediction service.
///
/// Renders a solid-colour PNG derived from the prompt into `output_dir` and
/// answers with a `file://` reference. With `pending_polls > 0` a submission
/// reports `starting` and only succeeds after that many polls. Pending
/// predictions nobody polled to completion are dropped once `stale_after`
/// has passed.
pub struct DryrunInference {
    output_dir: PathBuf,
    pending_polls: u32,
    stale_after: Duration,
    width: u32,
    height: u32,
    pending: Mutex<HashMap<String, PendingPrediction>>,
}

struct PendingPrediction {
    remaining_polls: u32,
    prompt: String,
    submitted_at: Instant,
}

impl DryrunInference {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            pending_polls: 0,
            stale_after: DEFAULT_STALE_AFTER,
            width: 256,
            height: 256,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_pending_polls(mut self, pending_polls: u32) -> Self {
        self.pending_polls = pending_polls;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    async fn render(&self, prediction_id: &str, prompt: &str) -> Result<Value, InferenceError> {
        let (r, g, b) = color_from_prompt(prompt);
        let mut image = RgbImage::new(self.width, self.height);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut encoded = Cursor::new(Vec::new());
        image
            .write_to(&mut encoded, ImageFormat::Png)
            .map_err(|err| InferenceError::Io(std::io::Error::other(err.to_string())))?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(format!("{prediction_id}.png"));
        tokio::fs::write(&path, encoded.into_inner()).await?;
        let absolute = std::path::absolute(&path)?;
        Ok(Value::Array(vec![Value::String(format!(
            "file://{}",
            absolute.display()
        ))]))
    }
}

#[async_trait]
impl InferenceService for DryrunInference {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn submit(&self, request: &InferenceRequest) -> Result<Prediction, InferenceError> {
        let id = format!("dryrun-{}", uuid::Uuid::new_v4().simple());
        if self.pending_polls == 0 {
            let output = self.render(&id, &request.prompt).await?;
            return Ok(Prediction {
                id,
                status: PredictionStatus::Succeeded,
                output: Some(output),
                error: None,
            });
        }
        let mut pending = self.pending.lock().await;
        pending.retain(|_, entry| entry.submitted_at.elapsed() < self.stale_after);
        pending.insert(
            id.clone(),
            PendingPrediction {
                remaining_polls: self.pending_polls,
                prompt: request.prompt.clone(),
                submitted_at: Instant::now(),
            },
        );
        drop(pending);
        Ok(Prediction {
            id,
            status: PredictionStatus::Starting,
            output: None,
            error: None,
        })
    }

    async fn poll(&self, prediction_id: &str) -> Result<Prediction, InferenceError> {
        let ready_prompt = {
            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.get_mut(prediction_id) else {
                return Err(InferenceError::Http {
                    service: SERVICE.to_string(),
                    status: 404,
                    body: format!("unknown prediction {prediction_id}"),
                });
            };
            entry.remaining_polls = entry.remaining_polls.saturating_sub(1);
            if entry.remaining_polls > 0 {
                None
            } else {
                pending.remove(prediction_id).map(|entry| entry.prompt)
            }
        };
        match ready_prompt {
            Some(prompt) => Ok(Prediction {
                id: prediction_id.to_string(),
                status: PredictionStatus::Succeeded,
                output: Some(self.render(prediction_id, &prompt).await?),
                error: None,
            }),
            None => Ok(Prediction {
                id: prediction_id.to_string(),
                status: PredictionStatus::Processing,
                output: None,
                error: None,
            }),
        }
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
