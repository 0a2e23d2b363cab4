use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::clothing::ClothingItem;
use crate::tiers::QualityTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

/// Input references of a job. Inline images are recorded by content digest,
/// uploaded ones by their object-store URL once the upload has happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum JobInputs {
    TryOn {
        model_image: String,
        clothing: Vec<ClothingItem>,
    },
    Edit {
        image: String,
        instruction: String,
    },
}

/// One user-initiated generation request ("try-on history entry").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub identity: String,
    pub inputs: JobInputs,
    pub tier: QualityTier,
    /// Absent for edit-mode jobs, which are never cached.
    pub cache_key: Option<String>,
    pub gems_charged: u64,
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub prediction_id: Option<String>,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn processing(
        job_id: impl Into<String>,
        identity: impl Into<String>,
        inputs: JobInputs,
        tier: QualityTier,
        cache_key: Option<String>,
        gems_charged: u64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            identity: identity.into(),
            inputs,
            tier,
            cache_key,
            gems_charged,
            status: JobStatus::Processing,
            result_url: None,
            prediction_id: None,
            error_kind: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn complete(&mut self, result_url: impl Into<String>) {
        self.status = JobStatus::Completed;
        self.result_url = Some(result_url.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error_kind: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_kind = Some(error_kind.into());
        self.completed_at = Some(Utc::now());
    }

    /// Whether this record can answer a request carrying `cache_key` at `tier`.
    pub fn serves_cache_hit(&self, cache_key: &str, tier: QualityTier) -> bool {
        self.status == JobStatus::Completed
            && self.tier == tier
            && self.cache_key.as_deref() == Some(cache_key)
            && self.result_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::jobs::clothing::ClothingCategory;

    fn try_on_record() -> JobRecord {
        JobRecord::processing(
            "job-1",
            "user-1",
            JobInputs::TryOn {
                model_image: "https://cdn/model.png".to_string(),
                clothing: vec![ClothingItem::new(ClothingCategory::Top, "https://cdn/top.png")],
            },
            QualityTier::Standard,
            Some("key-1".to_string()),
            1,
        )
    }

    #[test]
    fn only_completed_records_serve_cache_hits() {
        let mut record = try_on_record();
        assert!(!record.serves_cache_hit("key-1", QualityTier::Standard));

        record.complete("https://cdn/result.png");
        assert!(record.serves_cache_hit("key-1", QualityTier::Standard));
        assert!(!record.serves_cache_hit("key-1", QualityTier::Hd));
        assert!(!record.serves_cache_hit("key-2", QualityTier::Standard));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn failed_record_keeps_error_kind() {
        let mut record = try_on_record();
        record.fail("timeout");
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.completed_at.is_some());
        assert_eq!(record.error_kind.as_deref(), Some("timeout"));
        assert!(!record.serves_cache_hit("key-1", QualityTier::Standard));
    }

    #[test]
    fn inputs_serialize_with_mode_tag() -> anyhow::Result<()> {
        let inputs = JobInputs::Edit {
            image: "https://cdn/a.png".to_string(),
            instruction: "make the sleeves shorter".to_string(),
        };
        let value = serde_json::to_value(&inputs)?;
        assert_eq!(value["mode"], json!("edit"));
        assert_eq!(value["instruction"], json!("make the sleeves shorter"));
        Ok(())
    }
}
