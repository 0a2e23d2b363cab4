use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use thiserror::Error;

use crate::error::{ErrorKind, TryOnError};

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("image payload is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("image payload is {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("image signature is not JPEG or PNG")]
    UnsupportedFormat,
}

impl From<ImageError> for TryOnError {
    fn from(err: ImageError) -> Self {
        let status = match err {
            ImageError::PayloadTooLarge { .. } => 413,
            _ => 400,
        };
        TryOnError::new(ErrorKind::InvalidImage, err.to_string()).with_status(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedFormat {
    Jpeg,
    Png,
}

impl DetectedFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedImage {
    pub bytes: Vec<u8>,
    pub format: DetectedFormat,
}

/// Decode-and-classify gate for user supplied images.
#[derive(Debug, Clone, Copy)]
pub struct ImageValidator {
    max_bytes: usize,
}

impl Default for ImageValidator {
    fn default() -> Self {
        Self::new(MAX_IMAGE_BYTES)
    }
}

impl ImageValidator {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Validates a base64 payload, with or without a `data:` URL prefix.
    pub fn validate_encoded(&self, raw: &str) -> Result<ValidatedImage, ImageError> {
        let payload = strip_data_url_prefix(raw);
        let compact: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
        let bytes = BASE64
            .decode(compact.as_bytes())
            .map_err(|err| ImageError::InvalidEncoding(err.to_string()))?;
        self.validate_bytes(bytes)
    }

    pub fn validate_bytes(&self, bytes: Vec<u8>) -> Result<ValidatedImage, ImageError> {
        if bytes.len() > self.max_bytes {
            return Err(ImageError::PayloadTooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        let format = detect_format(&bytes)?;
        Ok(ValidatedImage { bytes, format })
    }
}

/// Identifies the format from leading signature bytes only.
pub fn detect_format(bytes: &[u8]) -> Result<DetectedFormat, ImageError> {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => Ok(DetectedFormat::Jpeg),
        Ok(ImageFormat::Png) => Ok(DetectedFormat::Png),
        _ => Err(ImageError::UnsupportedFormat),
    }
}

pub fn strip_data_url_prefix(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.starts_with("data:") {
        if let Some((_, payload)) = trimmed.split_once(',') {
            return payload;
        }
    }
    trimmed
}

/// True for references the object store can fetch by itself.
pub fn is_remote_reference(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.starts_with("https://") || trimmed.starts_with("http://")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];
    const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    fn jpeg_of_len(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        bytes[..3].copy_from_slice(&JPEG_SIGNATURE);
        bytes
    }

    #[test]
    fn accepts_jpeg_at_exact_limit() -> anyhow::Result<()> {
        let validator = ImageValidator::default();
        let image = validator.validate_bytes(jpeg_of_len(10_485_760))?;
        assert_eq!(image.format, DetectedFormat::Jpeg);
        assert_eq!(image.bytes.len(), MAX_IMAGE_BYTES);
        Ok(())
    }

    #[test]
    fn rejects_one_byte_over_limit() {
        let validator = ImageValidator::default();
        let err = validator.validate_bytes(jpeg_of_len(10_485_761)).unwrap_err();
        assert_eq!(
            err,
            ImageError::PayloadTooLarge {
                size: 10_485_761,
                limit: MAX_IMAGE_BYTES
            }
        );
        assert_eq!(TryOnError::from(err).status(), 413);
    }

    #[test]
    fn decodes_data_url_png() -> anyhow::Result<()> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 13]);
        let encoded = format!("data:image/png;base64,{}", BASE64.encode(&bytes));
        let image = ImageValidator::default().validate_encoded(&encoded)?;
        assert_eq!(image.format, DetectedFormat::Png);
        assert_eq!(image.bytes, bytes);
        Ok(())
    }

    #[test]
    fn declared_type_is_ignored() {
        let encoded = format!("data:image/png;base64,{}", BASE64.encode(b"GIF89a......"));
        let err = ImageValidator::default().validate_encoded(&encoded).unwrap_err();
        assert_eq!(err, ImageError::UnsupportedFormat);
    }

    #[test]
    fn rejects_bad_base64() {
        let err = ImageValidator::default()
            .validate_encoded("not base64 at all!!")
            .unwrap_err();
        assert!(matches!(err, ImageError::InvalidEncoding(_)));
        let classified = TryOnError::from(err);
        assert_eq!(classified.kind, ErrorKind::InvalidImage);
        assert_eq!(classified.status(), 400);
    }

    #[test]
    fn rejects_empty_and_truncated_signatures() {
        let validator = ImageValidator::default();
        assert_eq!(
            validator.validate_bytes(Vec::new()).unwrap_err(),
            ImageError::UnsupportedFormat
        );
        assert_eq!(
            validator.validate_bytes(PNG_SIGNATURE[..4].to_vec()).unwrap_err(),
            ImageError::UnsupportedFormat
        );
    }

    #[test]
    fn remote_references_are_detected() {
        assert!(is_remote_reference(" https://cdn.example/a.png"));
        assert!(!is_remote_reference("data:image/png;base64,AAAA"));
        assert!(!is_remote_reference("iVBORw0KGgo="));
    }

    proptest! {
        #[test]
        fn unknown_signatures_are_rejected(mut bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            if bytes.len() >= 3 && bytes[..3] == JPEG_SIGNATURE {
                bytes[0] = 0;
            }
            if bytes.len() >= 8 && bytes[..8] == PNG_SIGNATURE {
                bytes[0] = 0;
            }
            prop_assert_eq!(detect_format(&bytes), Err(ImageError::UnsupportedFormat));
        }

        #[test]
        fn jpeg_signature_accepted_under_limit(tail in prop::collection::vec(any::<u8>(), 0..256)) {
            let mut bytes = JPEG_SIGNATURE.to_vec();
            bytes.extend(tail);
            let image = ImageValidator::new(1024).validate_bytes(bytes).unwrap();
            prop_assert_eq!(image.format, DetectedFormat::Jpeg);
        }
    }
}
