//! CLI command implementations

pub mod filter;
pub mod info;

use anyhow::{Context, Result};
use image::{ColorType, DynamicImage, ImageFormat};
use std::path::Path;

/// Load image from path
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("Failed to load: {}", path.display()))
}

/// Save float RGBA pixels, matching the bit depth and alpha of the source
/// where the output format allows it.
pub fn save_image(path: &Path, pixels: image::Rgba32FImage, source: ColorType) -> Result<()> {
    let jpeg = matches!(ImageFormat::from_path(path), Ok(ImageFormat::Jpeg));
    let deep = source.bytes_per_pixel() / source.channel_count() > 1 && !jpeg;
    let alpha = source.has_alpha() && !jpeg;

    let image = DynamicImage::ImageRgba32F(pixels);
    let image = match (deep, alpha) {
        (true, true) => DynamicImage::ImageRgba16(image.to_rgba16()),
        (true, false) => DynamicImage::ImageRgb16(image.to_rgb16()),
        (false, true) => DynamicImage::ImageRgba8(image.to_rgba8()),
        (false, false) => DynamicImage::ImageRgb8(image.to_rgb8()),
    };
    image.save(path).with_context(|| format!("Failed to save: {}", path.display()))
}
