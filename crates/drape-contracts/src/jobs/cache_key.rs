use serde_json::json;
use sha2::{Digest, Sha256};

use crate::tiers::QualityTier;

/// Identifier for an inline image: the SHA-256 of its decoded bytes.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Fingerprint of a try-on request.
///
/// Clothing identifiers are treated as a multiset: they are trimmed and sorted
/// before hashing, so submission order never changes the key while any change
/// in membership, count, model image or tier does.
pub fn derive_cache_key(model_image: &str, clothing_images: &[String], tier: QualityTier) -> String {
    let mut clothing = clothing_images
        .iter()
        .map(|value| value.trim().to_string())
        .collect::<Vec<String>>();
    clothing.sort();
    stable_hash(&json!({
        "model": model_image.trim(),
        "clothing": clothing,
        "tier": tier.as_str(),
    }))
}

fn stable_hash(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn refs(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn reordering_clothing_keeps_the_key() {
        let a = derive_cache_key("model", &refs(&["shirt", "pants"]), QualityTier::Standard);
        let b = derive_cache_key("model", &refs(&["pants", "shirt"]), QualityTier::Standard);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn tier_and_membership_change_the_key() {
        let base = derive_cache_key("model", &refs(&["shirt", "pants"]), QualityTier::Standard);
        assert_ne!(
            base,
            derive_cache_key("model", &refs(&["shirt", "pants"]), QualityTier::Hd)
        );
        assert_ne!(
            base,
            derive_cache_key("model", &refs(&["shirt", "skirt"]), QualityTier::Standard)
        );
        assert_ne!(
            base,
            derive_cache_key("model", &refs(&["shirt", "pants", "pants"]), QualityTier::Standard)
        );
        assert_ne!(
            base,
            derive_cache_key("other-model", &refs(&["shirt", "pants"]), QualityTier::Standard)
        );
    }

    #[test]
    fn model_and_clothing_slots_are_distinct() {
        let a = derive_cache_key("shirt", &refs(&["model"]), QualityTier::Standard);
        let b = derive_cache_key("model", &refs(&["shirt"]), QualityTier::Standard);
        assert_ne!(a, b);
    }

    #[test]
    fn content_digest_is_prefixed_hex() {
        let digest = content_digest(b"abc");
        assert_eq!(
            digest,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    proptest! {
        #[test]
        fn key_is_order_independent(
            model in "[a-z]{1,6}",
            mut clothing in prop::collection::vec("[a-z]{1,6}", 1..6),
            hd in any::<bool>(),
        ) {
            let tier = if hd { QualityTier::Hd } else { QualityTier::Standard };
            let forward = derive_cache_key(&model, &clothing, tier);
            clothing.reverse();
            let reversed = derive_cache_key(&model, &clothing, tier);
            prop_assert_eq!(&forward, &reversed);

            let other_tier = if hd { QualityTier::Standard } else { QualityTier::Hd };
            prop_assert_ne!(forward.clone(), derive_cache_key(&model, &clothing, other_tier));

            let mut swapped = clothing.clone();
            swapped[0] = format!("{}-swapped", swapped[0]);
            prop_assert_ne!(forward, derive_cache_key(&model, &swapped, tier));
        }
    }
}
