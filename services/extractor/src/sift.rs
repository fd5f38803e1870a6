//! Default local-feature extractor.
//!
//! A compact difference-of-Gaussians detector over one grayscale octave
//! with 128-element gradient-histogram descriptors. The three tuning knobs
//! (feature cap, contrast threshold, edge-response threshold) surface
//! through the extractor configuration; everything else is fixed.

use crate::features::{descriptor_type, ExtractError, Extraction, FeatureExtractor};
use framecast_common::envelope::KeypointRecord;

const DESCRIPTOR_COLS: usize = 128;
const DESCRIPTOR_ELEM_SIZE: usize = 4;
/// Half-width of the 16x16 descriptor window.
const PATCH_RADIUS: usize = 8;
/// Keypoints this close to the border cannot produce a full descriptor.
const BORDER: usize = PATCH_RADIUS + 1;
const BASE_SIGMA: f32 = 1.6;
/// Scale step between adjacent blur levels (three levels per doubling).
const SIGMA_STEP: f32 = 1.259_921_05;
const BLUR_LEVELS: usize = 5;
const ORIENTATION_BINS: usize = 36;
const ORIENTATION_RADIUS: isize = 4;

/// Difference-of-Gaussians feature extractor.
pub struct SiftExtractor {
    n_features: usize,
    contrast_threshold: f32,
    edge_threshold: f32,
}

impl SiftExtractor {
    /// `n_features` of zero means unlimited.
    pub fn new(n_features: usize, contrast_threshold: f64, edge_threshold: f64) -> Self {
        Self {
            n_features,
            contrast_threshold: contrast_threshold as f32,
            edge_threshold: (edge_threshold as f32).max(1.0),
        }
    }
}

impl FeatureExtractor for SiftExtractor {
    fn extract(&self, image: &[u8]) -> Result<Extraction, ExtractError> {
        let decoded =
            image::load_from_memory(image).map_err(|err| ExtractError::Decode(err.to_string()))?;
        let gray = decoded.to_luma8();
        let plane = Plane::from_gray(&gray);

        if plane.width < 2 * BORDER + 1 || plane.height < 2 * BORDER + 1 {
            return Ok(empty_extraction());
        }

        let mut sigma = BASE_SIGMA;
        let mut blurred = Vec::with_capacity(BLUR_LEVELS);
        let mut sigmas = Vec::with_capacity(BLUR_LEVELS);
        for _ in 0..BLUR_LEVELS {
            blurred.push(plane.gaussian_blur(sigma));
            sigmas.push(sigma);
            sigma *= SIGMA_STEP;
        }
        let dogs: Vec<Plane> = blurred
            .windows(2)
            .map(|pair| Plane::difference(&pair[1], &pair[0]))
            .collect();

        let mut candidates = find_extrema(&dogs, self.contrast_threshold, self.edge_threshold);
        candidates.sort_by(|a, b| b.response.total_cmp(&a.response));
        if self.n_features > 0 {
            candidates.truncate(self.n_features);
        }

        let mut keypoints = Vec::with_capacity(candidates.len());
        let mut descriptors = Vec::with_capacity(candidates.len() * DESCRIPTOR_COLS * 4);
        for candidate in &candidates {
            let level = &blurred[candidate.scale];
            let angle = dominant_orientation(level, candidate.x, candidate.y);
            keypoints.push(KeypointRecord {
                x: candidate.x as f32,
                y: candidate.y as f32,
                size: sigmas[candidate.scale] * 2.0,
                angle,
                response: candidate.response,
                octave: 0,
                class_id: -1,
            });
            for value in describe(level, candidate.x, candidate.y) {
                descriptors.extend_from_slice(&value.to_le_bytes());
            }
        }

        Ok(Extraction {
            descriptor_rows: keypoints.len() as u32,
            descriptor_cols: DESCRIPTOR_COLS as u32,
            descriptor_elem_size: DESCRIPTOR_ELEM_SIZE as u32,
            descriptor_type: descriptor_type::F32,
            keypoints,
            descriptors,
        })
    }
}

fn empty_extraction() -> Extraction {
    Extraction {
        keypoints: Vec::new(),
        descriptors: Vec::new(),
        descriptor_rows: 0,
        descriptor_cols: DESCRIPTOR_COLS as u32,
        descriptor_elem_size: DESCRIPTOR_ELEM_SIZE as u32,
        descriptor_type: descriptor_type::F32,
    }
}

/// Grayscale intensity plane normalized to `0.0..=1.0`.
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(image: &image::GrayImage) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            data: image.as_raw().iter().map(|&v| f32::from(v) / 255.0).collect(),
        }
    }

    #[inline]
    fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Separable Gaussian blur with clamped borders.
    fn gaussian_blur(&self, sigma: f32) -> Plane {
        let radius = (sigma * 3.0).ceil() as isize;
        let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
        let denom = 2.0 * sigma * sigma;
        for offset in -radius..=radius {
            let distance = offset as f32;
            kernel.push((-(distance * distance) / denom).exp());
        }
        let sum: f32 = kernel.iter().sum();
        for weight in &mut kernel {
            *weight /= sum;
        }

        let clamp_x = |x: isize| x.clamp(0, self.width as isize - 1) as usize;
        let clamp_y = |y: isize| y.clamp(0, self.height as isize - 1) as usize;

        let mut horizontal = vec![0.0f32; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sx = clamp_x(x as isize + k as isize - radius);
                    acc += weight * self.get(sx, y);
                }
                horizontal[y * self.width + x] = acc;
            }
        }

        let mut output = vec![0.0f32; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sy = clamp_y(y as isize + k as isize - radius);
                    acc += weight * horizontal[sy * self.width + x];
                }
                output[y * self.width + x] = acc;
            }
        }

        Plane {
            width: self.width,
            height: self.height,
            data: output,
        }
    }

    fn difference(a: &Plane, b: &Plane) -> Plane {
        Plane {
            width: a.width,
            height: a.height,
            data: a
                .data
                .iter()
                .zip(b.data.iter())
                .map(|(lhs, rhs)| lhs - rhs)
                .collect(),
        }
    }

    #[inline]
    fn gradient(&self, x: usize, y: usize) -> (f32, f32) {
        let gx = (self.get(x + 1, y) - self.get(x - 1, y)) * 0.5;
        let gy = (self.get(x, y + 1) - self.get(x, y - 1)) * 0.5;
        (gx, gy)
    }
}

struct Candidate {
    x: usize,
    y: usize,
    scale: usize,
    response: f32,
}

/// Scan the interior DoG levels for 26-neighborhood extrema that clear the
/// contrast threshold and are not edge responses.
fn find_extrema(dogs: &[Plane], contrast_threshold: f32, edge_threshold: f32) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let width = dogs[0].width;
    let height = dogs[0].height;
    // Principal-curvature ratio test bound: (r + 1)^2 / r.
    let edge_bound = (edge_threshold + 1.0) * (edge_threshold + 1.0) / edge_threshold;

    for scale in 1..dogs.len() - 1 {
        let dog = &dogs[scale];
        for y in BORDER..height - BORDER {
            for x in BORDER..width - BORDER {
                let value = dog.get(x, y);
                if value.abs() < contrast_threshold {
                    continue;
                }
                if !is_extremum(dogs, scale, x, y, value) {
                    continue;
                }

                let dxx = dog.get(x + 1, y) - 2.0 * value + dog.get(x - 1, y);
                let dyy = dog.get(x, y + 1) - 2.0 * value + dog.get(x, y - 1);
                let dxy = (dog.get(x + 1, y + 1) - dog.get(x + 1, y - 1)
                    - dog.get(x - 1, y + 1)
                    + dog.get(x - 1, y - 1))
                    / 4.0;
                let trace = dxx + dyy;
                let det = dxx * dyy - dxy * dxy;
                if det <= 0.0 || trace * trace / det >= edge_bound {
                    continue;
                }

                candidates.push(Candidate {
                    x,
                    y,
                    scale,
                    response: value.abs(),
                });
            }
        }
    }
    candidates
}

fn is_extremum(dogs: &[Plane], scale: usize, x: usize, y: usize, value: f32) -> bool {
    let positive = value > 0.0;
    for (offset, level) in dogs[scale - 1..=scale + 1].iter().enumerate() {
        for dy in -1isize..=1 {
            for dx in -1isize..=1 {
                if offset == 1 && dx == 0 && dy == 0 {
                    continue;
                }
                let nx = (x as isize + dx) as usize;
                let ny = (y as isize + dy) as usize;
                let neighbor = level.get(nx, ny);
                if positive && neighbor >= value {
                    return false;
                }
                if !positive && neighbor <= value {
                    return false;
                }
            }
        }
    }
    true
}

/// Peak of a 36-bin gradient-orientation histogram around the keypoint,
/// in degrees.
fn dominant_orientation(level: &Plane, x: usize, y: usize) -> f32 {
    let mut histogram = [0.0f32; ORIENTATION_BINS];
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            let sx = (x as isize + dx) as usize;
            let sy = (y as isize + dy) as usize;
            let (gx, gy) = level.gradient(sx, sy);
            let magnitude = (gx * gx + gy * gy).sqrt();
            let angle = gy.atan2(gx).to_degrees().rem_euclid(360.0);
            let bin = ((angle / 360.0) * ORIENTATION_BINS as f32) as usize % ORIENTATION_BINS;
            histogram[bin] += magnitude;
        }
    }

    let mut best = 0;
    for bin in 1..ORIENTATION_BINS {
        if histogram[bin] > histogram[best] {
            best = bin;
        }
    }
    (best as f32 + 0.5) * (360.0 / ORIENTATION_BINS as f32)
}

/// 4x4 spatial cells x 8 orientation bins over a 16x16 gradient window,
/// L2-normalized with the usual 0.2 clamp-and-renormalize.
fn describe(level: &Plane, x: usize, y: usize) -> [f32; DESCRIPTOR_COLS] {
    let mut descriptor = [0.0f32; DESCRIPTOR_COLS];
    let radius = PATCH_RADIUS as isize;

    for dy in -radius..radius {
        for dx in -radius..radius {
            let sx = (x as isize + dx) as usize;
            let sy = (y as isize + dy) as usize;
            let (gx, gy) = level.gradient(sx, sy);
            let magnitude = (gx * gx + gy * gy).sqrt();
            let angle = gy.atan2(gx).to_degrees().rem_euclid(360.0);

            let cell_x = ((dx + radius) / 4) as usize;
            let cell_y = ((dy + radius) / 4) as usize;
            let bin = ((angle / 45.0) as usize).min(7);
            descriptor[(cell_y * 4 + cell_x) * 8 + bin] += magnitude;
        }
    }

    normalize(&mut descriptor);
    for value in &mut descriptor {
        *value = value.min(0.2);
    }
    normalize(&mut descriptor);
    descriptor
}

fn normalize(descriptor: &mut [f32; DESCRIPTOR_COLS]) {
    let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in descriptor.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(image: RgbImage) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn flat_image(width: u32, height: u32) -> Vec<u8> {
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([128, 128, 128]);
        }
        png_bytes(img)
    }

    fn blob_image() -> Vec<u8> {
        let mut img = RgbImage::new(64, 64);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let dx = x as f32 - 32.0;
            let dy = y as f32 - 32.0;
            let value = (255.0 * (-(dx * dx + dy * dy) / 18.0).exp()) as u8;
            *pixel = Rgb([value, value, value]);
        }
        png_bytes(img)
    }

    #[test]
    fn undecodable_bytes_error() {
        let extractor = SiftExtractor::new(0, 0.04, 10.0);
        assert!(matches!(
            extractor.extract(b"definitely not a png"),
            Err(ExtractError::Decode(_))
        ));
    }

    #[test]
    fn flat_image_has_no_features() {
        let extractor = SiftExtractor::new(0, 0.04, 10.0);
        let extraction = extractor.extract(&flat_image(64, 64)).unwrap();
        assert!(extraction.keypoints.is_empty());
        assert!(extraction.descriptors.is_empty());
        assert_eq!(extraction.descriptor_rows, 0);
    }

    #[test]
    fn tiny_image_has_no_features() {
        let extractor = SiftExtractor::new(0, 0.04, 10.0);
        let extraction = extractor.extract(&flat_image(8, 8)).unwrap();
        assert!(extraction.keypoints.is_empty());
    }

    #[test]
    fn descriptor_shape_invariants_hold() {
        let extractor = SiftExtractor::new(0, 0.01, 10.0);
        let extraction = extractor.extract(&blob_image()).unwrap();

        assert_eq!(extraction.keypoints.len() as u32, extraction.descriptor_rows);
        assert_eq!(extraction.descriptor_cols, 128);
        assert_eq!(extraction.descriptor_elem_size, 4);
        assert_eq!(extraction.descriptor_type, descriptor_type::F32);
        assert_eq!(
            extraction.descriptors.len(),
            (extraction.descriptor_rows * extraction.descriptor_cols
                * extraction.descriptor_elem_size) as usize
        );
        for keypoint in &extraction.keypoints {
            assert!(keypoint.x >= 0.0 && keypoint.x < 64.0);
            assert!(keypoint.y >= 0.0 && keypoint.y < 64.0);
            assert!(keypoint.response > 0.0);
            assert!((0.0..360.0).contains(&keypoint.angle));
        }
    }

    #[test]
    fn extraction_is_deterministic() {
        let extractor = SiftExtractor::new(0, 0.01, 10.0);
        let bytes = blob_image();
        let first = extractor.extract(&bytes).unwrap();
        let second = extractor.extract(&bytes).unwrap();
        assert_eq!(first.keypoints.len(), second.keypoints.len());
        assert_eq!(first.descriptors, second.descriptors);
    }

    #[test]
    fn feature_cap_bounds_keypoint_count() {
        let extractor = SiftExtractor::new(3, 0.005, 10.0);
        let extraction = extractor.extract(&blob_image()).unwrap();
        assert!(extraction.keypoints.len() <= 3);
        assert_eq!(extraction.keypoints.len() as u32, extraction.descriptor_rows);
    }
}
