//! Data logger service for the framecast imaging pipeline.
//!
//! Subscribes to the extractor's processed-frame stream and persists each
//! envelope twice: the raw (and optional annotated) PNG bytes to disk, and
//! one row with the descriptor blob plus full metadata to SQLite. A row is
//! only inserted after the raw image write succeeded, so every persisted
//! row points at an existing file.

mod record;
mod store;

use anyhow::Context;
use clap::Parser;
use framecast_common::bus::{connect_with_retry, recv_envelope, RecvOutcome, RECV_TIMEOUT_MS};
use framecast_common::envelope::{DOWNSTREAM_MAX_PARTS, DOWNSTREAM_MIN_PARTS};
use framecast_common::{
    init_logging, install_shutdown_handlers, load_app_config, now_iso8601, resolve_env_path,
    EnvFile, LoggerConfig,
};
use record::FrameFields;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{FrameRecord, FrameStore};
use tracing::{debug, error, info, warn};

const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Data logger - consumes processed frames and stores them
#[derive(Parser, Debug)]
#[command(name = "framecast-logger", version)]
struct Args {
    /// Path to the .env file (overrides DIST_ENV_PATH)
    #[arg(long)]
    env: Option<PathBuf>,

    /// Override log level (trace|debug|info|warn|error|critical)
    #[arg(long)]
    log_level: Option<String>,
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

    info!(
        "starting data logger v{} (log level {})",
        env!("CARGO_PKG_VERSION"),
        level
    );

    let running = Arc::new(AtomicBool::new(true));
    install_shutdown_handlers(running.clone()).context("failed to install signal handlers")?;

    ensure_output_directories(&config.logger)?;

    let store = match FrameStore::open(&config.logger.db_path) {
        Ok(store) => store,
        Err(err) => {
            error!("{}", err);
            return Err(err.into());
        }
    };

    let ctx = zmq::Context::new();
    let sink = ctx.socket(zmq::SUB).context("failed to create SUB socket")?;
    sink.set_rcvhwm(100)?;
    sink.set_rcvtimeo(RECV_TIMEOUT_MS)?;
    sink.set_linger(0)?;
    sink.set_subscribe(b"")?;
    if !connect_with_retry(&sink, &config.logger.sub_endpoint, "SUB socket", &running) {
        info!("shutdown requested before ingress connect completed");
        return Ok(());
    }

    info!("listening for processed frames on {}", config.logger.sub_endpoint);
    info!("saving PNGs to {}", config.logger.raw_image_dir.display());
    info!(
        "saving annotated PNGs to {}",
        config.logger.annotated_dir.display()
    );
    info!("persisting metadata to {}", config.logger.db_path.display());

    let result = run_loop(&config.logger, &sink, &store, &running);

    drop(sink);
    drop(ctx);
    info!("data logger shutting down");
    result
}

/// Create every directory later file writes rely on so a blank deployment
/// directory works.
fn ensure_output_directories(config: &LoggerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.raw_image_dir).with_context(|| {
        format!("failed to create raw image dir {}", config.raw_image_dir.display())
    })?;
    std::fs::create_dir_all(&config.annotated_dir).with_context(|| {
        format!("failed to create annotated dir {}", config.annotated_dir.display())
    })?;
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database dir {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn run_loop(
    config: &LoggerConfig,
    sink: &zmq::Socket,
    store: &FrameStore,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let mut last_wait_log = Instant::now()
        .checked_sub(WAIT_LOG_INTERVAL)
        .unwrap_or_else(Instant::now);

    while running.load(Ordering::SeqCst) {
        let parts = match recv_envelope(sink, DOWNSTREAM_MIN_PARTS, DOWNSTREAM_MAX_PARTS) {
            Ok(RecvOutcome::Parts(parts)) => parts,
            Ok(RecvOutcome::Timeout) => {
                if last_wait_log.elapsed() >= WAIT_LOG_INTERVAL {
                    info!("waiting for processed frames on {}", config.sub_endpoint);
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
        debug!("received {} parts from extractor", parts.len());

        let mut header: serde_json::Value = match serde_json::from_slice(&parts[0]) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to parse metadata JSON: {}", err);
                continue;
            }
        };
        let fields = FrameFields::from_header(&header);
        let descriptors = &parts[1];
        let image = &parts[2];
        let annotated = parts.get(3);

        let image_path = config.raw_image_dir.join(fields.raw_image_name());
        if let Err(err) = std::fs::write(&image_path, image) {
            error!("failed to write {}: {}", image_path.display(), err);
            continue;
        }

        // An empty annotated part means "nothing attached": no file and no
        // annotated_path in the persisted metadata.
        if let Some(annotated) = annotated.filter(|bytes| !bytes.is_empty()) {
            let annotated_path = config.annotated_dir.join(fields.annotated_image_name());
            match std::fs::write(&annotated_path, annotated) {
                Ok(()) => {
                    if let Some(map) = header.as_object_mut() {
                        map.insert(
                            "annotated_path".to_string(),
                            serde_json::Value::String(annotated_path.display().to_string()),
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        "failed to write annotated frame {}: {}",
                        annotated_path.display(),
                        err
                    );
                }
            }
        }

        let metadata_json = header.to_string();
        let created_at = now_iso8601();
        let image_path_text = image_path.display().to_string();
        let frame_record = FrameRecord {
            fields: &fields,
            descriptors,
            image_path: &image_path_text,
            metadata_json: &metadata_json,
            created_at: &created_at,
        };
        if let Err(err) = store.insert_frame(&frame_record) {
            error!("{}", err);
            continue;
        }

        info!(
            "stored frame {} ({} keypoints, {} bytes)",
            fields.frame_id,
            fields.keypoint_count,
            image.len()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_all_output_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggerConfig {
            sub_endpoint: "tcp://127.0.0.1:5556".to_string(),
            db_path: dir.path().join("db/frames.sqlite"),
            raw_image_dir: dir.path().join("raw"),
            annotated_dir: dir.path().join("annotated"),
        };

        ensure_output_directories(&config).unwrap();
        assert!(config.raw_image_dir.is_dir());
        assert!(config.annotated_dir.is_dir());
        assert!(dir.path().join("db").is_dir());

        // Idempotent on an already-populated tree.
        ensure_output_directories(&config).unwrap();
    }

    #[test]
    fn cli_accepts_documented_flags() {
        let args = Args::try_parse_from(["framecast-logger", "--env", "/tmp/pipeline.env"]).unwrap();
        assert_eq!(args.env, Some(PathBuf::from("/tmp/pipeline.env")));
        assert!(args.log_level.is_none());
    }
}
