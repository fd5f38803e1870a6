//! Feature-extraction contract.
//!
//! The pipeline treats the detector as a pluggable collaborator with one
//! operation: decode an encoded frame and return keypoints plus a packed
//! descriptor blob. Anything satisfying [`FeatureExtractor`] can stand in,
//! including a fixed-output fake in tests.

use framecast_common::envelope::KeypointRecord;
use thiserror::Error;

/// Errors that can occur during feature extraction
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("feature detection failed: {0}")]
    Detection(String),
}

/// Integer element-type codes carried in headers alongside descriptor blobs.
pub mod descriptor_type {
    pub const U8: i32 = 0;
    pub const F32: i32 = 1;
}

/// Result of one decode-and-extract invocation.
///
/// Invariants: `keypoints.len() == descriptor_rows`, and `descriptors.len()
/// == descriptor_rows * descriptor_cols * descriptor_elem_size` (both zero
/// when nothing was detected).
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub keypoints: Vec<KeypointRecord>,
    /// Packed row-major descriptor blob; may be empty
    pub descriptors: Vec<u8>,
    pub descriptor_rows: u32,
    pub descriptor_cols: u32,
    pub descriptor_elem_size: u32,
    pub descriptor_type: i32,
}

/// Decode an encoded frame and extract local features from it.
pub trait FeatureExtractor {
    fn extract(&self, image: &[u8]) -> Result<Extraction, ExtractError>;
}
