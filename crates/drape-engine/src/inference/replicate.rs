use async_trait::async_trait;
use reqwest::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use super::{
    is_retryable_inference_error, truncate_text, InferenceError, InferenceRequest,
    InferenceService, Prediction, PredictionStatus,
};
use crate::retry::{is_transient_error, retry, RetryPolicy};

const SERVICE: &str = "replicate";

/// Replicate predictions API client.
///
/// Submissions ask the API to hold the connection (`Prefer: wait`) so short
/// jobs come back terminal on the first response; anything still running is
/// left to the caller's poll loop.
pub struct ReplicateClient {
    api_base: String,
    api_key: String,
    model_version: String,
    retry_policy: RetryPolicy,
    http: HttpClient,
}

impl ReplicateClient {
    pub fn new(
        api_base: &str,
        api_key: impl Into<String>,
        model_version: impl Into<String>,
        retry_policy: RetryPolicy,
    ) -> Result<Self, InferenceError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(InferenceError::Misconfigured(
                "replicate api key not set".to_string(),
            ));
        }
        let model_version = model_version.into();
        if model_version.trim().is_empty() {
            return Err(InferenceError::Misconfigured(
                "replicate model version not set".to_string(),
            ));
        }
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key,
            model_version,
            retry_policy,
            http: HttpClient::new(),
        })
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.api_base)
    }

    fn build_payload(&self, request: &InferenceRequest) -> Value {
        let mut input = Map::new();
        input.insert("prompt".to_string(), json!(request.prompt));
        input.insert("negative_prompt".to_string(), json!(request.negative_prompt));
        input.insert(
            "num_inference_steps".to_string(),
            json!(request.params.num_inference_steps),
        );
        input.insert(
            "guidance_scale".to_string(),
            json!(request.params.guidance_scale),
        );
        if let Some((person, garments)) = request.image_urls.split_first() {
            input.insert("image".to_string(), json!(person));
            if !garments.is_empty() {
                input.insert("garment_images".to_string(), json!(garments));
            }
        }
        json!({
            "version": self.model_version,
            "input": Value::Object(input),
        })
    }

    async fn post_prediction(&self, payload: &Value) -> Result<Value, InferenceError> {
        let endpoint = self.predictions_endpoint();
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header("Prefer", "wait")
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;
        response_json_or_error(response).await
    }

    async fn get_prediction(&self, prediction_id: &str) -> Result<Value, InferenceError> {
        let poll_url = format!("{}/{}", self.predictions_endpoint(), prediction_id);
        let response = self
            .http
            .get(&poll_url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        response_json_or_error(response).await
    }
}

#[async_trait]
impl InferenceService for ReplicateClient {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn submit(&self, request: &InferenceRequest) -> Result<Prediction, InferenceError> {
        let payload = &self.build_payload(request);
        let raw = retry(&self.retry_policy, is_retryable_inference_error, move |_| {
            self.post_prediction(payload)
        })
        .await?;
        parse_prediction(&raw)
    }

    async fn poll(&self, prediction_id: &str) -> Result<Prediction, InferenceError> {
        let raw = retry(&self.retry_policy, is_retryable_inference_error, move |_| {
            self.get_prediction(prediction_id)
        })
        .await?;
        parse_prediction(&raw)
    }
}

fn transport_error(err: reqwest::Error) -> InferenceError {
    InferenceError::Transport {
        service: SERVICE.to_string(),
        retryable: err.is_timeout()
            || err.is_connect()
            || err.is_request()
            || is_transient_error(&err),
        message: err.to_string(),
    }
}

async fn response_json_or_error(response: HttpResponse) -> Result<Value, InferenceError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(InferenceError::Http {
            service: SERVICE.to_string(),
            status: code,
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|err| InferenceError::InvalidPayload {
        service: SERVICE.to_string(),
        message: err.to_string(),
    })
}

fn parse_prediction(payload: &Value) -> Result<Prediction, InferenceError> {
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| InferenceError::InvalidPayload {
            service: SERVICE.to_string(),
            message: "prediction missing id".to_string(),
        })?;
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .map(PredictionStatus::parse)
        .unwrap_or(PredictionStatus::Starting);
    let output = payload.get("output").filter(|value| !value.is_null()).cloned();
    let error = match payload.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(truncate_text(text, 512)),
        Some(other) => Some(truncate_text(&other.to_string(), 512)),
    };
    Ok(Prediction {
        id: id.to_string(),
        status,
        output,
        error,
    })
}
