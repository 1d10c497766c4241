//! Thumbnail derivation
//!
//! Every artifact carries a renderable thumbnail. When the screenshot cannot
//! be decoded a flat placeholder of the same size is used instead.

use crate::CaptureError;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use tracing::warn;

pub const THUMBNAIL_WIDTH: u32 = 400;
pub const THUMBNAIL_HEIGHT: u32 = 300;

/// Background transparent pixels are flattened onto.
const BACKGROUND: [u8; 3] = [255, 255, 255];
const PLACEHOLDER_FILL: [u8; 3] = [224, 224, 224];

/// 1x1 gray PNG, used only if encoding the placeholder itself fails.
const FALLBACK_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x00, 0x3A,
    0x7E, 0x9B, 0x55, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x78,
    0x00, 0x00, 0x00, 0xE2, 0x00, 0xE1, 0x15, 0x76, 0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Downscales `full_image` to fit `width` x `height`, preserving aspect
/// ratio, and flattens any transparency onto white.
pub fn make_thumbnail(full_image: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    let img = image::load_from_memory(full_image)
        .map_err(|e| CaptureError::CaptureFailure(format!("Failed to decode screenshot: {e}")))?;

    let scaled = img.thumbnail(width, height).to_rgba8();
    let mut flat = RgbImage::from_pixel(scaled.width(), scaled.height(), Rgb(BACKGROUND));
    for (x, y, px) in scaled.enumerate_pixels() {
        let alpha = px[3] as u32;
        let blend = |fg: u8, bg: u8| ((fg as u32 * alpha + bg as u32 * (255 - alpha)) / 255) as u8;
        flat.put_pixel(
            x,
            y,
            Rgb([
                blend(px[0], BACKGROUND[0]),
                blend(px[1], BACKGROUND[1]),
                blend(px[2], BACKGROUND[2]),
            ]),
        );
    }

    encode_png(DynamicImage::ImageRgb8(flat))
}

pub fn placeholder(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width.max(1), height.max(1), Rgb(PLACEHOLDER_FILL));
    encode_png(DynamicImage::ImageRgb8(img)).unwrap_or_else(|e| {
        warn!("Failed to encode placeholder thumbnail: {}", e);
        FALLBACK_PNG.to_vec()
    })
}

/// Never fails: a thumbnail error degrades to the placeholder.
pub fn thumbnail_or_placeholder(full_image: &[u8], width: u32, height: u32) -> Vec<u8> {
    match make_thumbnail(full_image, width, height) {
        Ok(thumb) => thumb,
        Err(e) => {
            warn!("Thumbnail generation failed, using placeholder: {}", e);
            placeholder(width, height)
        }
    }
}

fn encode_png(img: DynamicImage) -> Result<Vec<u8>, CaptureError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| CaptureError::CaptureFailure(format!("Failed to encode PNG: {e}")))?;
    Ok(buf)
}
