use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use drape_contracts::QualityTier;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::validator::MAX_IMAGE_BYTES;

/// Upper bound on `polling.timeout_ms` (one hour).
pub const MAX_POLL_TIMEOUT_MS: u64 = 3_600_000;

/// Engine configuration, passed explicitly to the orchestrator factory.
///
/// Every section has defaults, so an empty JSON object is a valid config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
    pub pricing: PricingConfig,
    pub limits: LimitsConfig,
    pub polling: PollingConfig,
    pub retry: RetryConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// `replicate` or `dryrun`.
    pub provider: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_version: String,
    pub output_dir: PathBuf,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: "replicate".to_string(),
            base_url: "https://api.replicate.com/v1".to_string(),
            api_key: None,
            model_version: String::new(),
            output_dir: PathBuf::from("outputs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub root: PathBuf,
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "tryon-images".to_string(),
            root: PathBuf::from("storage"),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub standard: u64,
    pub hd: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self { standard: 1, hd: 2 }
    }
}

impl PricingConfig {
    /// Edits are always billed at the standard rate.
    pub fn cost(&self, tier: QualityTier, edit_mode: bool) -> u64 {
        match (edit_mode, tier) {
            (true, _) | (false, QualityTier::Standard) => self.standard,
            (false, QualityTier::Hd) => self.hd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_clothing_items: usize,
    pub max_image_bytes: usize,
    pub rate_limit_requests: u32,
    pub rate_limit_window_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clothing_items: 5,
            max_image_bytes: MAX_IMAGE_BYTES,
            rate_limit_requests: 10,
            rate_limit_window_ms: 60_000,
        }
    }
}

impl LimitsConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            timeout_ms: 180_000,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Zero disables the per-attempt timer.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            attempt_timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: (self.attempt_timeout_ms > 0)
                .then(|| Duration::from_millis(self.attempt_timeout_ms)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token to identity.
    pub tokens: HashMap<String, String>,
}

impl EngineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing config {}", path.display()))
    }

    /// Overlays deployment settings from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(non_empty_env);
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("DRAPE_INFERENCE_BASE_URL") {
            self.inference.base_url = value;
        }
        if let Some(value) =
            lookup("DRAPE_INFERENCE_API_KEY").or_else(|| lookup("REPLICATE_API_TOKEN"))
        {
            self.inference.api_key = Some(value);
        }
        if let Some(value) = lookup("DRAPE_INFERENCE_PROVIDER") {
            self.inference.provider = value.to_ascii_lowercase();
        }
        if let Some(value) = lookup("DRAPE_STORAGE_BUCKET") {
            self.storage.bucket = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pricing.standard == 0 || self.pricing.hd == 0 {
            bail!("pricing must charge at least one gem per tier");
        }
        if self.limits.max_clothing_items == 0
            || self.limits.max_image_bytes == 0
            || self.limits.rate_limit_requests == 0
            || self.limits.rate_limit_window_ms == 0
        {
            bail!("limits must be non-zero");
        }
        if self.polling.timeout_ms > MAX_POLL_TIMEOUT_MS {
            bail!(
                "polling.timeout_ms {} exceeds the {}ms ceiling",
                self.polling.timeout_ms,
                MAX_POLL_TIMEOUT_MS
            );
        }
        if self.polling.interval_ms == 0 || self.polling.interval_ms > self.polling.timeout_ms {
            bail!(
                "poll interval {}ms must be positive and within timeout {}ms",
                self.polling.interval_ms,
                self.polling.timeout_ms
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.storage.bucket.trim().is_empty() {
            bail!("storage.bucket must be set");
        }
        match self.inference.provider.as_str() {
            "replicate" | "dryrun" => Ok(()),
            other => bail!("unknown inference provider `{other}`"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
