//! End-to-end job pipeline.
//!
//! A job moves through `validating → rate_checked → cache_checked → reserved →
//! uploading → submitted → polling → completed | failed`. Everything before
//! `reserved` rejects without touching the ledger. Everything after it either
//! completes or leaves through [`JobOrchestrator::abort`], which hands the
//! outstanding charge to the [`ErrorClassifier`] for a single refund.

use std::sync::Arc;

use anyhow::Context;
use drape_contracts::{
    content_digest, derive_cache_key, sort_by_category, ClothingItem, JobInputs, JobRecord,
    QualityTier,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::{IdentityProvider, StaticTokenProvider};
use crate::classifier::{Charge, ErrorClassifier};
use crate::config::EngineConfig;
use crate::error::{ErrorKind, ErrorResponse, TryOnError};
use crate::inference::{
    DryrunInference, InferenceRequest, InferenceService, Prediction, PredictionStatus,
    ReplicateClient,
};
use crate::journal::JobJournal;
use crate::ledger::GemLedger;
use crate::object_store::{is_retryable_storage_error, LocalObjectStore, ObjectStore};
use crate::prompt::{build_edit_request, build_try_on_request, GenerationRequest};
use crate::rate_limit::{MemoryRateLimitStore, RateLimitStore, RateLimiter};
use crate::retry::{retry, RetryPolicy};
use crate::store::{JobStore, LedgerStore};
use crate::validator::{is_remote_reference, ImageValidator, ValidatedImage};

/// Request accepted from the UI layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TryOnRequest {
    /// Person photo for try-on, or the image to edit in edit mode.
    pub model_image: Option<String>,
    pub clothing_images: Vec<ClothingItem>,
    pub edit_prompt: Option<String>,
    pub quality_tier: QualityTier,
    pub edit_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TryOnResponse {
    pub job_id: String,
    pub result_url: String,
    pub gems_charged: u64,
    pub gems_remaining: u64,
    pub cached: bool,
    pub processing_time_ms: u64,
}

/// Collaborators the orchestrator is built from. The ledger store is expected
/// to carry service credentials: refunds go through it after the caller's
/// token may already have expired.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub ledger_store: Arc<dyn LedgerStore>,
    pub jobs: Arc<dyn JobStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub inference: Arc<dyn InferenceService>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub journal: JobJournal,
}

impl Collaborators {
    /// Local wiring: one store for ledger and jobs, filesystem objects, the
    /// configured inference provider and in-process rate limiting.
    pub fn local<S>(
        config: &EngineConfig,
        store: Arc<S>,
        journal: JobJournal,
    ) -> anyhow::Result<Self>
    where
        S: LedgerStore + JobStore + 'static,
    {
        let mut objects = LocalObjectStore::new(&config.storage.root, &config.storage.bucket);
        if let Some(base) = &config.storage.public_base_url {
            objects = objects.with_public_base_url(base);
        }
        Ok(Self {
            identity: Arc::new(StaticTokenProvider::new(config.auth.tokens.clone())),
            ledger_store: store.clone(),
            jobs: store,
            objects: Arc::new(objects),
            inference: build_inference(config)?,
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
            journal,
        })
    }
}

pub fn build_inference(config: &EngineConfig) -> anyhow::Result<Arc<dyn InferenceService>> {
    let inference = &config.inference;
    match inference.provider.as_str() {
        "dryrun" => Ok(Arc::new(DryrunInference::new(&inference.output_dir))),
        "replicate" => {
            let client = ReplicateClient::new(
                &inference.base_url,
                inference.api_key.clone().unwrap_or_default(),
                inference.model_version.clone(),
                config.retry.policy(),
            )
            .context("failed configuring replicate client")?;
            Ok(Arc::new(client))
        }
        other => anyhow::bail!("unknown inference provider `{other}`"),
    }
}

/// A validated image: a remote URL passed through, or decoded inline bytes.
#[derive(Debug, Clone)]
enum ImageInput {
    Remote(String),
    Inline(ValidatedImage),
}

impl ImageInput {
    /// Cache-key identity: the trimmed URL or the digest of the bytes.
    fn identifier(&self) -> String {
        match self {
            Self::Remote(url) => url.clone(),
            Self::Inline(image) => content_digest(&image.bytes),
        }
    }
}

#[derive(Debug, Clone)]
enum JobPlan {
    TryOn {
        model: ImageInput,
        clothing: Vec<(ClothingItem, ImageInput)>,
    },
    Edit {
        image: ImageInput,
        instruction: String,
    },
}

impl JobPlan {
    fn is_edit(&self) -> bool {
        matches!(self, Self::Edit { .. })
    }

    fn cache_key(&self, tier: QualityTier) -> Option<String> {
        match self {
            Self::TryOn { model, clothing } => {
                let clothing_ids: Vec<String> =
                    clothing.iter().map(|(_, image)| image.identifier()).collect();
                Some(derive_cache_key(&model.identifier(), &clothing_ids, tier))
            }
            Self::Edit { .. } => None,
        }
    }

    fn recorded_inputs(&self) -> JobInputs {
        match self {
            Self::TryOn { model, clothing } => JobInputs::TryOn {
                model_image: model.identifier(),
                clothing: clothing
                    .iter()
                    .map(|(item, image)| ClothingItem {
                        image: image.identifier(),
                        ..item.clone()
                    })
                    .collect(),
            },
            Self::Edit { image, instruction } => JobInputs::Edit {
                image: image.identifier(),
                instruction: instruction.clone(),
            },
        }
    }
}

pub struct JobOrchestrator {
    config: EngineConfig,
    validator: ImageValidator,
    retry_policy: RetryPolicy,
    identity: Arc<dyn IdentityProvider>,
    ledger: GemLedger,
    jobs: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    inference: Arc<dyn InferenceService>,
    limiter: RateLimiter,
    journal: JobJournal,
    classifier: ErrorClassifier,
}

impl JobOrchestrator {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> anyhow::Result<Self> {
        config.validate()?;
        let ledger = GemLedger::new(collaborators.ledger_store);
        let classifier = ErrorClassifier::new(ledger.clone(), collaborators.journal.clone());
        Ok(Self {
            validator: ImageValidator::new(config.limits.max_image_bytes),
            retry_policy: config.retry.policy(),
            identity: collaborators.identity,
            ledger,
            jobs: collaborators.jobs,
            objects: collaborators.objects,
            inference: collaborators.inference,
            limiter: RateLimiter::new(collaborators.rate_limits),
            journal: collaborators.journal,
            classifier,
            config,
        })
    }

    pub fn ledger(&self) -> &GemLedger {
        &self.ledger
    }

    pub async fn run(
        &self,
        token: &str,
        request: TryOnRequest,
    ) -> Result<TryOnResponse, ErrorResponse> {
        let started = Instant::now();

        let identity = match self.identity.resolve(token).await {
            Ok(identity) => identity.id,
            Err(err) => return Err(self.reject(err.into()).await),
        };
        let plan = match self.validate(&request) {
            Ok(plan) => plan,
            Err(err) => return Err(self.reject(err).await),
        };
        if let Err(err) = self.check_rate(&identity).await {
            return Err(self.reject(err).await);
        }

        let tier = request.quality_tier;
        let cache_key = plan.cache_key(tier);
        if let Some(key) = &cache_key {
            match self.lookup_cache(&identity, key, tier, started).await {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {}
                Err(err) => return Err(self.reject(err).await),
            }
        }

        let job_id = Uuid::new_v4().to_string();
        let cost = self.config.pricing.cost(tier, plan.is_edit());
        let reserved_balance = match self.ledger.reserve(&identity, cost, &job_id).await {
            Ok(balance) => balance,
            Err(err) => return Err(self.reject(err.into()).await),
        };
        self.journal.record(
            "gems_reserved",
            &job_id,
            json!({"identity": identity, "amount": cost, "balance": reserved_balance}),
        );
        let charge = Charge {
            identity: identity.clone(),
            job_id: job_id.clone(),
            amount: cost,
        };

        let mut record = JobRecord::processing(
            &job_id,
            &identity,
            plan.recorded_inputs(),
            if plan.is_edit() { QualityTier::Standard } else { tier },
            cache_key,
            cost,
        );
        if let Err(err) = self.jobs.insert_job(&record).await {
            return Err(self.abort(err.into(), &charge, None).await);
        }
        self.journal.record(
            "job_started",
            &job_id,
            json!({
                "identity": identity,
                "mode": if plan.is_edit() { "edit" } else { "try_on" },
                "tier": record.tier.as_str(),
                "cache_key": record.cache_key,
            }),
        );

        let span = tracing::info_span!("job", job_id = %job_id, identity = %identity);
        let outcome = self.process(&plan, &mut record).instrument(span).await;
        match outcome {
            Ok(result_url) => {
                let gems_remaining = match self.ledger.balance(&identity).await {
                    Ok(balance) => balance,
                    Err(err) => {
                        tracing::warn!(job_id = %job_id, error = %err, "balance lookup failed");
                        reserved_balance
                    }
                };
                let processing_time_ms = elapsed_ms(started);
                self.journal.record(
                    "job_completed",
                    &job_id,
                    json!({"result_url": result_url, "processing_time_ms": processing_time_ms}),
                );
                tracing::info!(job_id = %job_id, processing_time_ms, "job completed");
                Ok(TryOnResponse {
                    job_id,
                    result_url,
                    gems_charged: cost,
                    gems_remaining,
                    cached: false,
                    processing_time_ms,
                })
            }
            Err(err) => Err(self.abort(err, &charge, Some(&mut record)).await),
        }
    }

    fn validate(&self, request: &TryOnRequest) -> Result<JobPlan, TryOnError> {
        let max_items = self.config.limits.max_clothing_items;
        if request.clothing_images.len() > max_items {
            return Err(TryOnError::new(
                ErrorKind::TooManyItems,
                format!(
                    "{} clothing items submitted (limit {max_items})",
                    request.clothing_images.len()
                ),
            ));
        }
        let base = request
            .model_image
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| TryOnError::invalid_request("model image is required"))?;
        let base = self.intake(base)?;

        if request.edit_mode {
            let instruction = request
                .edit_prompt
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| TryOnError::invalid_request("edit mode requires an instruction"))?;
            return Ok(JobPlan::Edit {
                image: base,
                instruction: instruction.to_string(),
            });
        }

        if request.clothing_images.is_empty() {
            return Err(TryOnError::invalid_request(
                "at least one clothing item is required",
            ));
        }
        let clothing = request
            .clothing_images
            .iter()
            .map(|item| {
                if item.image.trim().is_empty() {
                    return Err(TryOnError::invalid_request("clothing item has no image"));
                }
                Ok((item.clone(), self.intake(&item.image)?))
            })
            .collect::<Result<Vec<_>, TryOnError>>()?;
        Ok(JobPlan::TryOn {
            model: base,
            clothing,
        })
    }

    fn intake(&self, raw: &str) -> Result<ImageInput, TryOnError> {
        if is_remote_reference(raw) {
            return Ok(ImageInput::Remote(raw.trim().to_string()));
        }
        Ok(ImageInput::Inline(self.validator.validate_encoded(raw)?))
    }

    async fn check_rate(&self, identity: &str) -> Result<(), TryOnError> {
        let limits = &self.config.limits;
        let decision = self
            .limiter
            .check(identity, limits.rate_limit_requests, limits.rate_limit_window())
            .await;
        if decision.allowed {
            return Ok(());
        }
        let mut err = TryOnError::new(
            ErrorKind::RateLimitExceeded,
            format!("rate limit reached; window resets at {}", decision.reset_at),
        );
        if let Some(retry_after) = decision.retry_after {
            err = err.with_retry_after(retry_after);
        }
        Err(err)
    }

    async fn lookup_cache(
        &self,
        identity: &str,
        cache_key: &str,
        tier: QualityTier,
        started: Instant,
    ) -> Result<Option<TryOnResponse>, TryOnError> {
        let Some(prior) = self.jobs.find_cached(identity, cache_key, tier).await? else {
            return Ok(None);
        };
        let Some(result_url) = prior.result_url.clone() else {
            return Ok(None);
        };
        let gems_remaining = self.ledger.balance(identity).await?;
        self.journal.record(
            "cache_hit",
            &prior.job_id,
            json!({"identity": identity, "cache_key": cache_key, "tier": tier.as_str()}),
        );
        tracing::info!(identity = %identity, job_id = %prior.job_id, "served from cache");
        Ok(Some(TryOnResponse {
            job_id: prior.job_id,
            result_url,
            gems_charged: 0,
            gems_remaining,
            cached: true,
            processing_time_ms: elapsed_ms(started),
        }))
    }

    /// `uploading → submitted → polling → completed`. Returns the result URL.
    async fn process(&self, plan: &JobPlan, record: &mut JobRecord) -> Result<String, TryOnError> {
        let (generation, image_urls) = self.upload_inputs(plan, record).await?;

        let request = InferenceRequest {
            prompt: generation.prompt,
            negative_prompt: generation.negative_prompt,
            params: generation.params,
            image_urls,
        };
        let submitted = self.inference.submit(&request).await?;
        record.prediction_id = Some(submitted.id.clone());
        if let Err(err) = self.jobs.update_job(record).await {
            tracing::warn!(error = %err, "failed recording prediction id");
        }
        self.journal.record(
            "prediction_submitted",
            &record.job_id,
            json!({
                "service": self.inference.name(),
                "prediction_id": submitted.id,
                "status": submitted.status.as_str(),
            }),
        );

        let finished = self.await_prediction(submitted, &record.job_id).await?;
        let reference = finished.result_reference().ok_or_else(|| {
            TryOnError::processing(format!("prediction {} returned no output", finished.id))
        })?;

        let result_url = self.persist_result(&reference, record).await;
        record.complete(&result_url);
        if let Err(err) = self.jobs.update_job(record).await {
            // the generation succeeded and was paid for; keep the result
            tracing::error!(error = %err, "failed writing completed job record");
        }
        Ok(result_url)
    }

    async fn upload_inputs(
        &self,
        plan: &JobPlan,
        record: &mut JobRecord,
    ) -> Result<(GenerationRequest, Vec<String>), TryOnError> {
        let folder = format!(
            "inputs/{}/{}",
            path_segment(&record.identity),
            path_segment(&record.job_id)
        );
        let outcome = match plan {
            JobPlan::TryOn { model, clothing } => {
                let model_url = self.upload(model, &folder, "model").await?;
                let mut items = Vec::with_capacity(clothing.len());
                for (idx, (item, image)) in clothing.iter().enumerate() {
                    let url = self.upload(image, &folder, &format!("clothing-{idx}")).await?;
                    items.push(ClothingItem {
                        image: url,
                        ..item.clone()
                    });
                }
                record.inputs = JobInputs::TryOn {
                    model_image: model_url.clone(),
                    clothing: items.clone(),
                };
                let mut image_urls = vec![model_url];
                image_urls.extend(sort_by_category(&items).into_iter().map(|item| item.image));
                (build_try_on_request(&items, record.tier), image_urls)
            }
            JobPlan::Edit { image, instruction } => {
                let url = self.upload(image, &folder, "image").await?;
                record.inputs = JobInputs::Edit {
                    image: url.clone(),
                    instruction: instruction.clone(),
                };
                (build_edit_request(instruction), vec![url])
            }
        };
        self.jobs.update_job(record).await?;
        self.journal.record(
            "inputs_uploaded",
            &record.job_id,
            json!({"inputs": outcome.1.len()}),
        );
        Ok(outcome)
    }

    async fn upload(
        &self,
        input: &ImageInput,
        folder: &str,
        slot: &str,
    ) -> Result<String, TryOnError> {
        let image = match input {
            ImageInput::Remote(url) => return Ok(url.clone()),
            ImageInput::Inline(image) => image,
        };
        let path = format!("{folder}/{slot}.{}", image.format.extension());
        let objects = &self.objects;
        let bytes = &image.bytes;
        let path_ref = path.as_str();
        let content_type = image.format.mime_type();
        retry(&self.retry_policy, is_retryable_storage_error, move |_| {
            objects.put_bytes(bytes.clone(), path_ref, content_type)
        })
        .await
        .map_err(|err| err.into_upload_failure())
    }

    async fn await_prediction(
        &self,
        mut prediction: Prediction,
        job_id: &str,
    ) -> Result<Prediction, TryOnError> {
        let polling = self.config.polling;
        let deadline = Instant::now()
            .checked_add(polling.timeout())
            .ok_or_else(|| {
                TryOnError::processing(format!(
                    "poll timeout {:?} is out of range",
                    polling.timeout()
                ))
            })?;
        let mut polls = 0u32;
        while !prediction.status.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return Err(TryOnError::timeout(format!(
                    "prediction {} still {} after {:?}",
                    prediction.id,
                    prediction.status.as_str(),
                    polling.timeout()
                )));
            }
            tokio::time::sleep(polling.interval().min(deadline - now)).await;
            let polled =
                tokio::time::timeout_at(deadline, self.inference.poll(&prediction.id)).await;
            prediction = match polled {
                Ok(polled) => polled?,
                Err(_) => {
                    return Err(TryOnError::timeout(format!(
                        "poll for prediction {} outlived the ceiling",
                        prediction.id
                    )))
                }
            };
            polls += 1;
            self.journal.record(
                "prediction_polled",
                job_id,
                json!({"poll": polls, "status": prediction.status.as_str()}),
            );
        }

        match prediction.status {
            PredictionStatus::Succeeded => Ok(prediction),
            status => Err(TryOnError::processing(format!(
                "prediction {} {}: {}",
                prediction.id,
                status.as_str(),
                prediction.error.as_deref().unwrap_or("no error detail")
            ))),
        }
    }

    /// Copies the service's transient output into the bucket, falling back to
    /// the transient reference when the copy fails.
    async fn persist_result(&self, reference: &str, record: &JobRecord) -> String {
        let path = format!(
            "results/{}/{}.png",
            path_segment(&record.identity),
            path_segment(&record.job_id)
        );
        let objects = &self.objects;
        let path_ref = path.as_str();
        match retry(&self.retry_policy, is_retryable_storage_error, move |_| {
            objects.put_from_url(reference, path_ref)
        })
        .await
        {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(error = %err, "result persistence failed; using service reference");
                reference.to_string()
            }
        }
    }

    /// Failure before any gem moved.
    async fn reject(&self, err: TryOnError) -> ErrorResponse {
        self.classifier.handle(&err, None).await
    }

    /// Failure after reservation: the record is marked failed, then the
    /// classifier settles the charge.
    async fn abort(
        &self,
        err: TryOnError,
        charge: &Charge,
        record: Option<&mut JobRecord>,
    ) -> ErrorResponse {
        let kind = self.classifier.classify(&err);
        if let Some(record) = record {
            record.fail(kind.as_str());
            if let Err(store_err) = self.jobs.update_job(record).await {
                tracing::error!(
                    job_id = %charge.job_id,
                    error = %store_err,
                    "failed marking job as failed"
                );
            }
        }
        self.journal.record(
            "job_failed",
            &charge.job_id,
            json!({"error_kind": kind.as_str(), "detail": err.detail}),
        );
        self.classifier.handle(&err, Some(charge)).await
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Object-key segment: anything outside `[A-Za-z0-9._-]` becomes `_`.
fn path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        value => value.to_string(),
    }
}
