//! Image encoding: rendered `DynamicImage` → PNG bytes → base64 `ImageData`.
//!
//! PNG is lossless; JPEG artefacts around small slide text measurably hurt
//! vision-model transcription. `detail: "high"` asks OpenAI-style providers
//! for the full tile budget so footnotes and chart labels survive.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rendered page as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        width = img.width(),
        height = img.height(),
        bytes = buf.len(),
        "encoded page PNG"
    );
    Ok(buf)
}

/// Wrap PNG bytes for a multimodal chat message.
pub fn image_data(png: &[u8]) -> ImageData {
    ImageData::new(STANDARD.encode(png), "image/png").with_detail("high")
}
