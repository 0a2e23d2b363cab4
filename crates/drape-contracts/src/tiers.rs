use std::fmt;

use serde::{Deserialize, Serialize};

/// Quality level of a generation request.
///
/// Parsing is lenient: any value other than `hd` resolves to `standard`, so an
/// unrecognized tier is billed and generated as the cheaper tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum QualityTier {
    #[default]
    Standard,
    Hd,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
}

impl QualityTier {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hd" => Self::Hd,
            _ => Self::Standard,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Hd => "hd",
        }
    }

    pub fn params(self) -> GenerationParams {
        match self {
            Self::Standard => GenerationParams {
                num_inference_steps: 50,
                guidance_scale: 7.5,
            },
            Self::Hd => GenerationParams {
                num_inference_steps: 75,
                guidance_scale: 8.5,
            },
        }
    }
}

impl From<String> for QualityTier {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for QualityTier {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::QualityTier;

    #[test]
    fn tier_params_match_quality_table() {
        let standard = QualityTier::Standard.params();
        assert_eq!(standard.num_inference_steps, 50);
        assert_eq!(standard.guidance_scale, 7.5);

        let hd = QualityTier::Hd.params();
        assert_eq!(hd.num_inference_steps, 75);
        assert_eq!(hd.guidance_scale, 8.5);
    }

    #[test]
    fn unknown_tier_falls_back_to_standard() {
        assert_eq!(QualityTier::parse("ultra"), QualityTier::Standard);
        assert_eq!(QualityTier::parse(""), QualityTier::Standard);
        assert_eq!(QualityTier::parse(" HD "), QualityTier::Hd);
    }

    #[test]
    fn tier_serde_is_lenient_and_lowercase() -> anyhow::Result<()> {
        let tier: QualityTier = serde_json::from_value(json!("4k"))?;
        assert_eq!(tier, QualityTier::Standard);
        let tier: QualityTier = serde_json::from_value(json!("hd"))?;
        assert_eq!(tier, QualityTier::Hd);
        assert_eq!(serde_json::to_value(QualityTier::Hd)?, json!("hd"));
        Ok(())
    }
}
