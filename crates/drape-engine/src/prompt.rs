use drape_contracts::{sort_by_category, ClothingItem, GenerationParams, QualityTier};
use serde::Serialize;

pub const NEGATIVE_PROMPT: &str = "deformed, distorted, disfigured, bad anatomy, extra limbs, \
missing limbs, extra fingers, mutated hands, poorly drawn face, blurry, low quality, \
low resolution, watermark, text, cropped, duplicate";

const PRESERVATION_DIRECTIVES: &str = "Keep the person's face, facial features and expression \
exactly the same. Keep the hair style and hair color unchanged. Preserve the body shape, pose \
and body proportions. Keep the background and lighting consistent.";

/// Instructions and parameters for one inference submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub params: GenerationParams,
}

/// Try-on instructions: garments are described in layering order so the
/// dress (if any) leads and accessories come last.
pub fn build_try_on_request(items: &[ClothingItem], tier: QualityTier) -> GenerationRequest {
    let sorted = sort_by_category(items);
    let garments = sorted
        .iter()
        .enumerate()
        .map(|(idx, item)| format!("{}. {}", idx + 1, describe_item(item)))
        .collect::<Vec<String>>()
        .join("\n");

    let prompt = format!(
        "Virtual try-on. Dress the person in the first image with the following clothing, \
in this order:\n{garments}\nMatch each garment's color, pattern, texture and fit as shown in its \
reference image. Photorealistic result, natural fabric drape and shadows.\n{PRESERVATION_DIRECTIVES}"
    );

    GenerationRequest {
        prompt,
        negative_prompt: NEGATIVE_PROMPT.to_string(),
        params: tier.params(),
    }
}

/// Edit instructions: a fixed preservation template around the user's text.
pub fn build_edit_request(instruction: &str) -> GenerationRequest {
    let prompt = format!(
        "Edit the image as follows: {}\nChange only what the instruction asks for.\n\
{PRESERVATION_DIRECTIVES}",
        instruction.trim()
    );
    GenerationRequest {
        prompt,
        negative_prompt: NEGATIVE_PROMPT.to_string(),
        params: QualityTier::Standard.params(),
    }
}

fn describe_item(item: &ClothingItem) -> String {
    let mut text = match item.name.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(name) => format!("{} ({})", item.category.as_str(), name),
        None => item.category.as_str().to_string(),
    };
    if let Some(description) = item
        .description
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        text.push_str(": ");
        text.push_str(description);
    }
    text
}

#[cfg(test)]
mod tests {
    use drape_contracts::ClothingCategory;

    use super::*;

    fn item(category: ClothingCategory, name: &str) -> ClothingItem {
        ClothingItem {
            category,
            image: format!("https://cdn/{name}.png"),
            name: Some(name.to_string()),
            description: None,
        }
    }

    #[test]
    fn garments_render_in_layer_order() {
        let request = build_try_on_request(
            &[
                item(ClothingCategory::Shoes, "sneakers"),
                item(ClothingCategory::Top, "blouse"),
                item(ClothingCategory::Dress, "sundress"),
            ],
            QualityTier::Standard,
        );
        let dress = request.prompt.find("1. dress (sundress)").unwrap();
        let top = request.prompt.find("2. top (blouse)").unwrap();
        let shoes = request.prompt.find("3. shoes (sneakers)").unwrap();
        assert!(dress < top && top < shoes);
    }

    #[test]
    fn preservation_and_avoidance_always_present() {
        for request in [
            build_try_on_request(&[item(ClothingCategory::Top, "tee")], QualityTier::Hd),
            build_edit_request("make it red"),
        ] {
            let lowered = request.prompt.to_lowercase();
            assert!(lowered.contains("face"));
            assert!(lowered.contains("hair"));
            assert!(lowered.contains("body proportions"));
            assert!(request.negative_prompt.contains("deformed"));
            assert!(request.negative_prompt.contains("extra limbs"));
            assert!(request.negative_prompt.contains("low quality"));
        }
    }

    #[test]
    fn tier_selects_generation_params() {
        let items = [item(ClothingCategory::Top, "tee")];
        let hd = build_try_on_request(&items, QualityTier::Hd);
        assert_eq!(hd.params.num_inference_steps, 75);
        assert_eq!(hd.params.guidance_scale, 8.5);
        let fallback = build_try_on_request(&items, QualityTier::parse("cinematic"));
        assert_eq!(fallback.params.num_inference_steps, 50);
        assert_eq!(fallback.params.guidance_scale, 7.5);
    }

    #[test]
    fn edit_template_carries_instruction_only() {
        let request = build_edit_request("  shorten the sleeves ");
        assert!(request.prompt.starts_with("Edit the image as follows: shorten the sleeves\n"));
        assert!(!request.prompt.contains("Virtual try-on"));
        assert_eq!(request.params, QualityTier::Standard.params());
    }

    #[test]
    fn description_is_appended() {
        let mut coat = item(ClothingCategory::Top, "coat");
        coat.description = Some("wool, knee length".to_string());
        let request = build_try_on_request(&[coat], QualityTier::Standard);
        assert!(request.prompt.contains("1. top (coat): wool, knee length"));
    }
}
