//! Feature extractor service for the framecast imaging pipeline.
//!
//! Subscribes to the generator's frame stream, runs local-feature
//! extraction on every payload, and republishes enriched
//! `[header, descriptors, image, annotated?]` envelopes downstream.
//! Processed frames queue in a bounded pending queue whenever the logger
//! is absent or not keeping up.

mod annotate;
mod features;
mod sift;

use anyhow::Context;
use clap::Parser;
use features::FeatureExtractor;
use framecast_common::bus::{
    bind_with_retry, connect_with_retry, recv_envelope, send_parts, RecvOutcome, RECV_TIMEOUT_MS,
    SEND_TIMEOUT_MS,
};
use framecast_common::envelope::{
    ProcessedFrame, ProcessedHeader, MAX_ENVELOPE_BYTES, UPSTREAM_PARTS,
};
use framecast_common::{
    init_logging, install_shutdown_handlers, load_app_config, now_iso8601, resolve_env_path,
    EnvFile, ExtractorConfig, PendingQueue, SubscriberMonitor,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const NO_SUBSCRIBER_BACKOFF: Duration = Duration::from_millis(500);
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Feature extractor - consumes frames, extracts keypoints, republishes
#[derive(Parser, Debug)]
#[command(name = "framecast-extractor", version)]
struct Args {
    /// Path to the .env file (overrides DIST_ENV_PATH)
    #[arg(long)]
    env: Option<PathBuf>,

    /// Override log level (trace|debug|info|warn|error|critical)
    #[arg(long)]
    log_level: Option<String>,

    /// Attach annotated keypoint overlays to outgoing envelopes
    #[arg(long)]
    annotated: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let root = std::env::current_dir().context("failed to resolve working directory")?;
    let env_path = resolve_env_path(args.env.as_deref(), &root);

    let env = match EnvFile::from_path(&env_path) {
        Ok(env) => env,
        Err(err) => {
            let _ = init_logging("info");
            error!("failed to read environment file at {}: {}", env_path.display(), err);
            anyhow::bail!("unreadable environment file {}", env_path.display());
        }
    };

    let config = load_app_config(&env, &root);
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.global.log_level.clone());
    init_logging(&level).context("failed to initialize logging")?;

    let queue_depth = effective_queue_depth(config.extractor.queue_depth);

    info!(
        "starting feature extractor v{} (log level {})",
        env!("CARGO_PKG_VERSION"),
        level
    );
    info!("listening on {}", config.extractor.sub_endpoint);
    info!("publishing to {}", config.extractor.pub_endpoint);
    info!("queue depth: {}", queue_depth);

    let running = Arc::new(AtomicBool::new(true));
    install_shutdown_handlers(running.clone()).context("failed to install signal handlers")?;

    let ctx = zmq::Context::new();
    let subscriber = ctx.socket(zmq::SUB).context("failed to create SUB socket")?;
    subscriber.set_rcvtimeo(RECV_TIMEOUT_MS)?;
    subscriber.set_linger(0)?;
    subscriber.set_subscribe(b"")?;
    if !connect_with_retry(
        &subscriber,
        &config.extractor.sub_endpoint,
        "SUB socket",
        &running,
    ) {
        info!("shutdown requested before upstream connect completed");
        return Ok(());
    }

    let publisher = ctx.socket(zmq::PUB).context("failed to create PUB socket")?;
    publisher.set_sndhwm(100)?;
    publisher.set_sndtimeo(SEND_TIMEOUT_MS)?;
    publisher.set_linger(0)?;
    bind_with_retry(&publisher, &config.extractor.pub_endpoint, "PUB socket")?;

    let mut monitor = SubscriberMonitor::start(&ctx, &publisher, "extractor-pub")
        .context("failed to start subscriber monitor")?;

    let extractor = sift::SiftExtractor::new(
        config.extractor.sift_n_features,
        config.extractor.sift_contrast_threshold,
        config.extractor.sift_edge_threshold,
    );

    let result = run_loop(
        &config.extractor,
        args.annotated,
        queue_depth,
        &subscriber,
        &publisher,
        &monitor,
        &extractor,
        &running,
    );

    // Tear down in order: monitor thread first, then sockets, then context.
    monitor.stop();
    drop(publisher);
    drop(subscriber);
    drop(ctx);

    info!("feature extractor shutting down");
    result
}

fn effective_queue_depth(configured: usize) -> usize {
    if configured == 0 {
        warn!("FEATURE_EXTRACTOR_QUEUE_DEPTH=0 is invalid; using default 100");
        100
    } else {
        configured
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    config: &ExtractorConfig,
    send_annotated: bool,
    queue_depth: usize,
    subscriber: &zmq::Socket,
    publisher: &zmq::Socket,
    monitor: &SubscriberMonitor,
    extractor: &dyn FeatureExtractor,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let mut pending: PendingQueue<ProcessedFrame> = PendingQueue::new(queue_depth);
    let mut last_wait_log = Instant::now()
        .checked_sub(WAIT_LOG_INTERVAL)
        .unwrap_or_else(Instant::now);

    while running.load(Ordering::SeqCst) {
        flush_pending(&mut pending, monitor, publisher);

        let parts = match recv_envelope(subscriber, UPSTREAM_PARTS, UPSTREAM_PARTS) {
            Ok(RecvOutcome::Parts(parts)) => parts,
            Ok(RecvOutcome::Timeout) => {
                if last_wait_log.elapsed() >= WAIT_LOG_INTERVAL {
                    info!("waiting for frames on {}", config.sub_endpoint);
                    last_wait_log = Instant::now();
                }
                continue;
            }
            Ok(RecvOutcome::Malformed(reason)) => {
                warn!("discarding malformed envelope: {}", reason);
                continue;
            }
            Err(err) => {
                if running.load(Ordering::SeqCst) {
                    error!("bus receive error: {}", err);
                }
                break;
            }
        };

        let source: serde_json::Value = match serde_json::from_slice(&parts[0]) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to parse header JSON: {}", err);
                continue;
            }
        };
        let frame_id = source.get("frame_id").and_then(serde_json::Value::as_i64).unwrap_or(-1);
        let image = parts.into_iter().nth(1).unwrap_or_default();
        info!("received frame {} ({} bytes)", frame_id, image.len());

        let extraction = match extractor.extract(&image) {
            Ok(extraction) => extraction,
            Err(err) => {
                warn!("dropping frame {}: {}", frame_id, err);
                continue;
            }
        };

        let annotated: Vec<u8> = if send_annotated {
            match annotate::render_overlay(&image, &extraction.keypoints) {
                Ok(png) => png,
                Err(err) => {
                    warn!("failed to render overlay for frame {}: {}", frame_id, err);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        info!(
            "processed frame {} ({} keypoints)",
            frame_id,
            extraction.keypoints.len()
        );

        let header = ProcessedHeader {
            source,
            processed_timestamp: now_iso8601(),
            keypoint_count: extraction.keypoints.len() as u64,
            descriptor_rows: extraction.descriptor_rows,
            descriptor_cols: extraction.descriptor_cols,
            descriptor_elem_size: extraction.descriptor_elem_size,
            descriptor_type: extraction.descriptor_type,
            descriptors_bytes: extraction.descriptors.len() as u64,
            annotated_bytes: annotated.len() as u64,
            keypoints: extraction.keypoints,
        };
        let frame = ProcessedFrame {
            header_json: serde_json::to_string(&header)
                .context("failed to serialize processed header")?,
            descriptors: extraction.descriptors,
            image,
            annotated,
        };

        if frame.payload_bytes() > MAX_ENVELOPE_BYTES {
            warn!(
                "processed payload too large ({} bytes > {}); dropping frame {}",
                frame.payload_bytes(),
                MAX_ENVELOPE_BYTES,
                frame_id
            );
            continue;
        }

        if !monitor.has_subscriber() || !try_send(publisher, &frame, config) {
            if pending.push(frame).is_some() {
                warn!(
                    "extractor queue full ({} frames); dropped oldest",
                    pending.capacity()
                );
            }
            warn!("queued processed frame {} until the logger is available", frame_id);
            std::thread::sleep(NO_SUBSCRIBER_BACKOFF);
        }
    }

    Ok(())
}

fn try_send(publisher: &zmq::Socket, frame: &ProcessedFrame, config: &ExtractorConfig) -> bool {
    match send_parts(publisher, &frame.parts()) {
        Ok(()) => true,
        Err(zmq::Error::EAGAIN) => {
            warn!(
                "downstream consumer not keeping up on {}; queueing processed frame",
                config.pub_endpoint
            );
            false
        }
        Err(err) => {
            error!("failed to publish processed frame: {}", err);
            false
        }
    }
}

fn flush_pending(
    pending: &mut PendingQueue<ProcessedFrame>,
    monitor: &SubscriberMonitor,
    publisher: &zmq::Socket,
) {
    if pending.is_empty() {
        return;
    }
    let flushed = pending.flush_while(
        || monitor.has_subscriber(),
        |frame| match send_parts(publisher, &frame.parts()) {
            Ok(()) => true,
            Err(zmq::Error::EAGAIN) => false,
            Err(err) => {
                error!("failed to flush queued frame: {}", err);
                false
            }
        },
    );
    if flushed > 0 {
        info!("flushed {} queued frames to the logger", flushed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Extraction;
    use framecast_common::envelope::KeypointRecord;

    struct FixedExtractor {
        keypoints: usize,
    }

    impl FeatureExtractor for FixedExtractor {
        fn extract(&self, _image: &[u8]) -> Result<Extraction, features::ExtractError> {
            let keypoints: Vec<KeypointRecord> = (0..self.keypoints)
                .map(|i| KeypointRecord {
                    x: i as f32,
                    y: i as f32,
                    size: 3.2,
                    angle: 0.0,
                    response: 1.0,
                    octave: 0,
                    class_id: -1,
                })
                .collect();
            let descriptors = vec![0u8; self.keypoints * 128 * 4];
            Ok(Extraction {
                descriptor_rows: keypoints.len() as u32,
                descriptor_cols: 128,
                descriptor_elem_size: 4,
                descriptor_type: features::descriptor_type::F32,
                keypoints,
                descriptors,
            })
        }
    }

    #[test]
    fn fake_extractor_satisfies_contract() {
        let extractor = FixedExtractor { keypoints: 4 };
        let extraction = extractor.extract(b"ignored").unwrap();
        assert_eq!(extraction.keypoints.len() as u32, extraction.descriptor_rows);
        assert_eq!(
            extraction.descriptors.len(),
            (extraction.descriptor_rows * extraction.descriptor_cols
                * extraction.descriptor_elem_size) as usize
        );
    }

    #[test]
    fn processed_header_reflects_extraction() {
        let extractor = FixedExtractor { keypoints: 2 };
        let extraction = extractor.extract(b"ignored").unwrap();
        let header = ProcessedHeader {
            source: serde_json::json!({"frame_id": 9}),
            processed_timestamp: now_iso8601(),
            keypoint_count: extraction.keypoints.len() as u64,
            descriptor_rows: extraction.descriptor_rows,
            descriptor_cols: extraction.descriptor_cols,
            descriptor_elem_size: extraction.descriptor_elem_size,
            descriptor_type: extraction.descriptor_type,
            descriptors_bytes: extraction.descriptors.len() as u64,
            annotated_bytes: 0,
            keypoints: extraction.keypoints,
        };
        assert_eq!(header.keypoint_count, u64::from(header.descriptor_rows));
        assert_eq!(
            header.descriptors_bytes,
            u64::from(header.descriptor_rows)
                * u64::from(header.descriptor_cols)
                * u64::from(header.descriptor_elem_size)
        );
    }

    #[test]
    fn oversize_frames_are_detected_before_send() {
        let frame = ProcessedFrame {
            header_json: "{}".to_string(),
            descriptors: Vec::new(),
            image: vec![0u8; MAX_ENVELOPE_BYTES + 1],
            annotated: Vec::new(),
        };
        assert!(frame.payload_bytes() > MAX_ENVELOPE_BYTES);
    }

    #[test]
    fn cli_accepts_documented_flags() {
        let args =
            Args::try_parse_from(["framecast-extractor", "--annotated", "--log-level", "warn"])
                .unwrap();
        assert!(args.annotated);
        assert_eq!(args.log_level.as_deref(), Some("warn"));
    }
}
