//! Dispatch payload validation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use texflow_broker::ImageInfo;
use texflow_core::DomainError;

/// A decoded, structurally valid image payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidImage {
    pub bytes: Vec<u8>,
    pub info: ImageInfo,
}

/// Decode and validate the base64 image payload of a dispatch message.
///
/// Validation failures are deterministic: the same payload fails the same
/// way forever, so callers convert them into failed results rather than
/// requeueing.
pub fn decode_payload(image_data: &str) -> Result<ValidImage, DomainError> {
    let bytes = BASE64
        .decode(image_data)
        .map_err(|e| DomainError::validation(format!("image payload is not valid base64: {e}")))?;

    if bytes.is_empty() {
        return Err(DomainError::validation("image payload is empty"));
    }

    let format = image::guess_format(&bytes)
        .map_err(|e| DomainError::validation(format!("unrecognized image format: {e}")))?;
    let decoded = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| DomainError::validation(format!("image does not decode: {e}")))?;

    let info = ImageInfo {
        width: decoded.width(),
        height: decoded.height(),
        format: format
            .extensions_str()
            .first()
            .copied()
            .unwrap_or("unknown")
            .to_string(),
    };

    Ok(ValidImage { bytes, info })
}
