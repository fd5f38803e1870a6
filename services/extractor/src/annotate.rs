//! Keypoint overlay rendering.

use framecast_common::envelope::KeypointRecord;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

const MARKER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Decode a frame, draw one circle per keypoint (radius scaled from the
/// keypoint size), and return the overlay re-encoded as PNG.
pub fn render_overlay(
    image_bytes: &[u8],
    keypoints: &[KeypointRecord],
) -> Result<Vec<u8>, image::ImageError> {
    let mut canvas = image::load_from_memory(image_bytes)?.to_rgb8();

    for keypoint in keypoints {
        let radius = ((keypoint.size / 2.0).round() as i32).max(2);
        draw_circle(
            &mut canvas,
            keypoint.x.round() as i32,
            keypoint.y.round() as i32,
            radius,
        );
    }

    let mut png = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(canvas).write_to(&mut png, ImageFormat::Png)?;
    Ok(png.into_inner())
}

/// Midpoint circle outline; pixels falling outside the canvas are skipped.
fn draw_circle(canvas: &mut RgbImage, cx: i32, cy: i32, radius: i32) {
    let mut x = radius;
    let mut y = 0;
    let mut err = 1 - radius;

    while x >= y {
        for (px, py) in [
            (cx + x, cy + y),
            (cx - x, cy + y),
            (cx + x, cy - y),
            (cx - x, cy - y),
            (cx + y, cy + x),
            (cx - y, cy + x),
            (cx + y, cy - x),
            (cx - y, cy - x),
        ] {
            put_pixel_checked(canvas, px, py);
        }
        y += 1;
        if err < 0 {
            err += 2 * y + 1;
        } else {
            x -= 1;
            err += 2 * (y - x) + 1;
        }
    }
}

fn put_pixel_checked(canvas: &mut RgbImage, x: i32, y: i32) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, MARKER_COLOR);
    }
}
