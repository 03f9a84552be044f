//! Image encoding: uploaded image bytes → base64 PNG wrapped in `ImageData`.
//!
//! Uploads arrive as JPEG, PNG or whatever the phone camera produced. They
//! are decoded, downscaled when the longest edge exceeds
//! [`MAX_IMAGE_EDGE`], and re-encoded as PNG: lossless keeps printed digits
//! crisp, which matters more than payload size when the model has to read
//! unit prices. `detail: "high"` keeps fine print and small tables visible
//! to GPT-4-class models.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Longest edge, in pixels, sent to the vision model.
pub const MAX_IMAGE_EDGE: u32 = 2048;

/// Decode image bytes and encode them for the vision API.
pub fn encode_image(bytes: &[u8]) -> Result<ImageData, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    encode_dynamic(&fit_to_edge(img, MAX_IMAGE_EDGE))
}

/// Downscale so the longest edge is at most `max_edge`, keeping aspect.
fn fit_to_edge(img: DynamicImage, max_edge: u32) -> DynamicImage {
    if img.width().max(img.height()) <= max_edge {
        return img;
    }
    debug!(
        "Downscaling {}x{} image to fit {} px",
        img.width(),
        img.height(),
        max_edge
    );
    img.resize(max_edge, max_edge, FilterType::Lanczos3)
}

fn encode_dynamic(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
