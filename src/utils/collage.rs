use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

/// Lays the given images side by side on a white canvas, top-aligned, and
/// returns the result as PNG bytes. Transparent regions are flattened onto
/// white. Images that fail to decode are skipped; `None` when nothing is
/// left to compose.
pub fn build_collage(images: &[Vec<u8>]) -> Result<Option<Vec<u8>>> {
    let decoded: Vec<RgbaImage> = images
        .iter()
        .enumerate()
        .filter_map(|(i, data)| match image::load_from_memory(data) {
            Ok(img) => Some(img.to_rgba8()),
            Err(e) => {
                log::warn!("Skipping collage input {}: {}", i, e);
                None
            }
        })
        .collect();

    if decoded.is_empty() {
        return Ok(None);
    }

    let width: u32 = decoded.iter().map(|i| i.width()).sum();
    let height = decoded.iter().map(|i| i.height()).max().unwrap_or(0);
    let mut canvas = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));

    let mut x = 0i64;
    for img in &decoded {
        image::imageops::overlay(&mut canvas, img, x, 0);
        x += img.width() as i64;
    }

    let flattened = DynamicImage::ImageRgba8(canvas).to_rgb8();
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(flattened)
        .write_to(&mut buf, ImageFormat::Png)
        .context("Failed to encode collage")?;
    Ok(Some(buf.into_inner()))
}
