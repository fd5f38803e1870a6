//! Canonical PNG encoding of source images.

use anyhow::Context;
use image::ImageFormat;
use std::io::Cursor;
use std::path::Path;

/// A source image normalized to 3-channel PNG bytes.
#[derive(Debug, Clone)]
pub struct CanonicalFrame {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// Decode a file and re-encode it as RGB PNG so every payload on the bus
/// carries the same encoding regardless of the source format.
pub fn canonical_png(path: &Path) -> anyhow::Result<CanonicalFrame> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let decoded = image::load_from_memory(&bytes)
        .with_context(|| format!("failed to decode {}", path.display()))?;

    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut png = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(rgb)
        .write_to(&mut png, ImageFormat::Png)
        .with_context(|| format!("failed to encode {}", path.display()))?;

    Ok(CanonicalFrame {
        png: png.into_inner(),
        width,
        height,
        channels: 3,
    })
}
