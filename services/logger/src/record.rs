//! Processed-frame header interpretation and on-disk naming.
//!
//! Headers arrive as free-form JSON and may predate fields this stage
//! knows about, so every lookup tolerates a missing key and substitutes
//! a default instead of rejecting the envelope.

use framecast_common::now_iso8601;
use serde_json::Value;

/// Fields the logger persists, extracted from a downstream header.
#[derive(Debug, Clone)]
pub struct FrameFields {
    pub frame_id: i64,
    pub loop_iteration: i64,
    pub source_timestamp: String,
    pub processed_timestamp: String,
    pub filename: String,
    pub width: i64,
    pub height: i64,
    pub channels: i64,
    pub encoding: String,
    pub keypoint_count: u64,
    pub descriptor_rows: i64,
    pub descriptor_cols: i64,
    pub descriptor_elem_size: i64,
    pub descriptor_type: i64,
}

impl FrameFields {
    /// Extract every persisted field, defaulting what is absent: missing
    /// `frame_id` becomes -1, counters zero, strings empty, `encoding`
    /// "png", and a missing processed timestamp becomes the current UTC
    /// time.
    pub fn from_header(header: &Value) -> Self {
        let source = header.get("source");

        Self {
            frame_id: int_or(source, "frame_id", -1),
            loop_iteration: int_or(source, "loop_iteration", 0),
            source_timestamp: str_or(source, "timestamp", ""),
            processed_timestamp: header
                .get("processed_timestamp")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(now_iso8601),
            filename: str_or(source, "filename", ""),
            width: int_or(source, "width", 0),
            height: int_or(source, "height", 0),
            channels: int_or(source, "channels", 0),
            encoding: str_or(source, "encoding", "png"),
            keypoint_count: header
                .get("keypoint_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            descriptor_rows: int_or(Some(header), "descriptor_rows", 0),
            descriptor_cols: int_or(Some(header), "descriptor_cols", 0),
            descriptor_elem_size: int_or(Some(header), "descriptor_elem_size", 0),
            descriptor_type: int_or(Some(header), "descriptor_type", 0),
        }
    }

    /// Raw image filename: `frame_{id:06}_{sanitized timestamp}.png`, with
    /// negative ids clamped to zero.
    pub fn raw_image_name(&self) -> String {
        format!("frame_{:06}_{}.png", self.frame_id.max(0), sanitize(&self.processed_timestamp))
    }

    /// Annotated overlay filename: the raw stem with an `_annotated` suffix.
    pub fn annotated_image_name(&self) -> String {
        format!(
            "frame_{:06}_{}_annotated.png",
            self.frame_id.max(0),
            sanitize(&self.processed_timestamp)
        )
    }
}

fn int_or(value: Option<&Value>, key: &str, fallback: i64) -> i64 {
    value
        .and_then(|v| v.get(key))
        .and_then(Value::as_i64)
        .unwrap_or(fallback)
}

fn str_or(value: Option<&Value>, key: &str, fallback: &str) -> String {
    value
        .and_then(|v| v.get(key))
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

/// Replace anything outside `[A-Za-z0-9._-]` so timestamps embed safely in
/// filenames.
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
