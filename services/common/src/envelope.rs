//! Multipart envelope contract between the pipeline stages.
//!
//! A unit of work travels the bus as a sequence of positional parts, all
//! delivered atomically. The first part is always a UTF-8 JSON header;
//! every other part is an uninterpreted byte buffer.
//!
//! Upstream (generator -> extractor): `[header, image]`.
//! Downstream (extractor -> logger): `[header, descriptors, image]` plus an
//! optional trailing annotated-overlay part. Presence of the fourth part is
//! the only signal that an overlay is attached.

use serde::{Deserialize, Serialize};

/// Hard cap on the summed payload bytes of one envelope. Anything larger is
/// dropped by the sender with a warning.
pub const MAX_ENVELOPE_BYTES: usize = 50 * 1024 * 1024;

/// Part count of an upstream envelope.
pub const UPSTREAM_PARTS: usize = 2;
/// Minimum part count of a downstream envelope.
pub const DOWNSTREAM_MIN_PARTS: usize = 3;
/// Maximum part count of a downstream envelope (with annotated overlay).
pub const DOWNSTREAM_MAX_PARTS: usize = 4;

/// Header of an upstream frame envelope. Senders always emit every field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    pub frame_id: u64,
    pub loop_iteration: u64,
    /// ISO-8601 UTC capture timestamp
    pub timestamp: String,
    /// Basename of the source file
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Always `"png"`; payloads are canonicalized before publish
    pub encoding: String,
    /// Encoded payload size
    pub bytes: u64,
}

/// One detected keypoint as carried in the downstream header.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeypointRecord {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub angle: f32,
    pub response: f32,
    pub octave: i32,
    pub class_id: i32,
}

/// Header of a downstream processed envelope.
///
/// The upstream header is nested verbatim under `source` so the logger can
/// persist exactly what the generator emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedHeader {
    pub source: serde_json::Value,
    pub processed_timestamp: String,
    pub keypoint_count: u64,
    pub descriptor_rows: u32,
    pub descriptor_cols: u32,
    pub descriptor_elem_size: u32,
    /// Integer element-type code reported by the extractor
    pub descriptor_type: i32,
    pub descriptors_bytes: u64,
    pub annotated_bytes: u64,
    pub keypoints: Vec<KeypointRecord>,
}

/// A ready-to-send upstream envelope.
#[derive(Debug, Clone)]
pub struct FrameEnvelope {
    pub header_json: String,
    pub image: Vec<u8>,
}

impl FrameEnvelope {
    /// Positional multipart layout.
    pub fn parts(&self) -> [&[u8]; UPSTREAM_PARTS] {
        [self.header_json.as_bytes(), &self.image]
    }
}

/// A ready-to-send downstream envelope.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub header_json: String,
    pub descriptors: Vec<u8>,
    pub image: Vec<u8>,
    pub annotated: Vec<u8>,
}

impl ProcessedFrame {
    /// Positional multipart layout. The annotated part is attached only when
    /// non-empty; its presence is the signal that an overlay exists.
    pub fn parts(&self) -> Vec<&[u8]> {
        let mut parts: Vec<&[u8]> =
            vec![self.header_json.as_bytes(), &self.descriptors, &self.image];
        if !self.annotated.is_empty() {
            parts.push(&self.annotated);
        }
        parts
    }

    /// Summed payload bytes counted against [`MAX_ENVELOPE_BYTES`].
    pub fn payload_bytes(&self) -> usize {
        self.descriptors.len() + self.image.len() + self.annotated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(annotated: Vec<u8>) -> ProcessedFrame {
        ProcessedFrame {
            header_json: "{}".to_string(),
            descriptors: vec![1, 2, 3],
            image: vec![4, 5],
            annotated,
        }
    }

    #[test]
    fn frame_header_round_trips() {
        let header = FrameHeader {
            frame_id: 7,
            loop_iteration: 2,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            filename: "frame.png".to_string(),
            width: 640,
            height: 480,
            channels: 3,
            encoding: "png".to_string(),
            bytes: 1234,
        };
        let json = serde_json::to_string(&header).unwrap();
        let parsed: FrameHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.frame_id, 7);
        assert_eq!(parsed.loop_iteration, 2);
        assert_eq!(parsed.filename, "frame.png");
        assert_eq!(parsed.encoding, "png");
    }

    #[test]
    fn upstream_envelope_has_two_parts() {
        let envelope = FrameEnvelope {
            header_json: "{\"frame_id\":0}".to_string(),
            image: vec![9, 9, 9],
        };
        let parts = envelope.parts();
        assert_eq!(parts.len(), UPSTREAM_PARTS);
        assert_eq!(parts[0], envelope.header_json.as_bytes());
        assert_eq!(parts[1], &[9, 9, 9]);
    }

    #[test]
    fn annotated_part_attached_only_when_non_empty() {
        assert_eq!(sample_frame(Vec::new()).parts().len(), DOWNSTREAM_MIN_PARTS);
        assert_eq!(sample_frame(vec![7]).parts().len(), DOWNSTREAM_MAX_PARTS);
    }

    #[test]
    fn payload_bytes_sums_all_blobs() {
        assert_eq!(sample_frame(Vec::new()).payload_bytes(), 5);
        assert_eq!(sample_frame(vec![7, 7]).payload_bytes(), 7);
    }

    #[test]
    fn size_cap_is_fifty_mib() {
        assert_eq!(MAX_ENVELOPE_BYTES, 52_428_800);
    }

    #[test]
    fn processed_header_nests_source_verbatim() {
        let source: serde_json::Value =
            serde_json::from_str("{\"frame_id\":3,\"custom\":\"kept\"}").unwrap();
        let header = ProcessedHeader {
            source: source.clone(),
            processed_timestamp: "2026-01-01T00:00:00Z".to_string(),
            keypoint_count: 0,
            descriptor_rows: 0,
            descriptor_cols: 128,
            descriptor_elem_size: 4,
            descriptor_type: 1,
            descriptors_bytes: 0,
            annotated_bytes: 0,
            keypoints: Vec::new(),
        };
        let json = serde_json::to_string(&header).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["source"], source);
        assert_eq!(parsed["keypoint_count"], 0);
    }
}
