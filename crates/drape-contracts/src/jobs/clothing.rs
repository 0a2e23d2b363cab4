use serde::{Deserialize, Serialize};

/// Garment category. Ordering follows how garments layer visually: a dress
/// subsumes separates, so it renders first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClothingCategory {
    Dress,
    Top,
    Bottom,
    Shoes,
    #[serde(alias = "accessory")]
    Accessories,
    #[serde(other)]
    Other,
}

impl ClothingCategory {
    pub fn rank(self) -> u8 {
        match self {
            Self::Dress => 0,
            Self::Top => 1,
            Self::Bottom => 2,
            Self::Shoes => 3,
            Self::Accessories => 4,
            Self::Other => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dress => "dress",
            Self::Top => "top",
            Self::Bottom => "bottom",
            Self::Shoes => "shoes",
            Self::Accessories => "accessories",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dress" => Self::Dress,
            "top" => Self::Top,
            "bottom" => Self::Bottom,
            "shoes" => Self::Shoes,
            "accessories" | "accessory" => Self::Accessories,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClothingItem {
    pub category: ClothingCategory,
    /// Remote URL, data URL or bare base64 payload.
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ClothingItem {
    pub fn new(category: ClothingCategory, image: impl Into<String>) -> Self {
        Self {
            category,
            image: image.into(),
            name: None,
            description: None,
        }
    }
}

/// Stable sort into category precedence. Items within one category keep
/// their submitted order.
pub fn sort_by_category(items: &[ClothingItem]) -> Vec<ClothingItem> {
    let mut sorted = items.to_vec();
    sorted.sort_by_key(|item| item.category.rank());
    sorted
}
