//! Frame generator service for the framecast imaging pipeline.
//!
//! Enumerates a directory of encoded images, normalizes each file to
//! canonical PNG bytes, and publishes `[header, image]` envelopes on the
//! upstream PUB socket. A subscriber-presence monitor drives backpressure:
//! with no subscriber connected, frames park in a bounded pending queue
//! instead of vanishing into the fan-out socket.

mod discover;
mod frames;

use anyhow::{bail, Context};
use clap::Parser;
use framecast_common::bus::{bind_with_retry, send_parts, SEND_TIMEOUT_MS};
use framecast_common::envelope::{FrameEnvelope, FrameHeader, MAX_ENVELOPE_BYTES};
use framecast_common::{
    init_logging, install_shutdown_handlers, load_app_config, now_iso8601, resolve_env_path,
    EnvFile, GeneratorConfig, PendingQueue, SubscriberMonitor,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SUBSCRIBER_POLL: Duration = Duration::from_millis(50);
const NO_SUBSCRIBER_BACKOFF: Duration = Duration::from_millis(500);

/// Frame generator - publishes image frames on the upstream bus
#[derive(Parser, Debug)]
#[command(name = "framecast-generator", version)]
struct Args {
    /// Path to the .env file (overrides DIST_ENV_PATH)
    #[arg(long)]
    env: Option<PathBuf>,

    /// Override log level (trace|debug|info|warn|error|critical)
    #[arg(long)]
    log_level: Option<String>,

    /// Publish the dataset a single time instead of looping
    #[arg(long)]
    once: bool,
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
            bail!("unreadable environment file {}", env_path.display());
        }
    };

    let config = load_app_config(&env, &root);
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.global.log_level.clone());
    init_logging(&level).context("failed to initialize logging")?;

    info!(
        "starting frame generator v{} (log level {})",
        env!("CARGO_PKG_VERSION"),
        level
    );
    info!("input directory: {}", config.generator.input_dir.display());
    info!("publish endpoint: {}", config.generator.pub_endpoint);
    info!("loop delay: {} ms", config.generator.loop_delay_ms);

    let images = discover::collect_images(&config.generator.input_dir);
    if images.is_empty() {
        error!(
            "no readable images found under {}",
            config.generator.input_dir.display()
        );
        bail!("empty input directory");
    }
    info!("discovered {} input images", images.len());

    let running = Arc::new(AtomicBool::new(true));
    install_shutdown_handlers(running.clone()).context("failed to install signal handlers")?;

    let ctx = zmq::Context::new();
    let publisher = ctx.socket(zmq::PUB).context("failed to create PUB socket")?;
    publisher.set_sndhwm(10)?;
    publisher.set_sndtimeo(SEND_TIMEOUT_MS)?;
    publisher.set_linger(0)?;
    bind_with_retry(&publisher, &config.generator.pub_endpoint, "PUB socket")?;

    let mut monitor = SubscriberMonitor::start(&ctx, &publisher, "generator-pub")
        .context("failed to start subscriber monitor")?;

    wait_for_first_subscriber(&config.generator, &monitor, &running);

    let mut stats = SweepStats::default();
    let result = run_sweeps(
        &args,
        &config.generator,
        &images,
        &publisher,
        &monitor,
        &running,
        &mut stats,
    );

    // Tear down in order: monitor thread first, then sockets, then context.
    monitor.stop();
    drop(publisher);
    drop(ctx);

    info!("generator shutting down (frames sent: {})", stats.frames_sent);
    result
}

/// Post-bind warmup: an unconditional settle delay, then a bounded poll for
/// the first subscriber. Publishing without one is allowed but noisy.
fn wait_for_first_subscriber(
    config: &GeneratorConfig,
    monitor: &SubscriberMonitor,
    running: &AtomicBool,
) {
    std::thread::sleep(Duration::from_millis(config.start_delay_ms));

    let deadline = Instant::now() + Duration::from_millis(config.subscriber_wait_ms);
    while !monitor.has_subscriber() && Instant::now() < deadline && running.load(Ordering::SeqCst)
    {
        std::thread::sleep(SUBSCRIBER_POLL);
    }

    if monitor.has_subscriber() {
        info!("subscriber connected; starting publish loop");
    } else {
        warn!(
            "no subscriber appeared within {} ms; frames will queue until one connects",
            config.subscriber_wait_ms
        );
    }
}

#[derive(Debug, Default)]
struct SweepStats {
    frames_sent: u64,
}

fn run_sweeps(
    args: &Args,
    config: &GeneratorConfig,
    images: &[PathBuf],
    publisher: &zmq::Socket,
    monitor: &SubscriberMonitor,
    running: &AtomicBool,
    stats: &mut SweepStats,
) -> anyhow::Result<()> {
    let queue_depth = effective_queue_depth(config.queue_depth);
    let mut pending: PendingQueue<FrameEnvelope> = PendingQueue::new(queue_depth);
    let loop_delay = Duration::from_millis(config.loop_delay_ms);
    let heartbeat = Duration::from_millis(config.heartbeat_ms.max(1));
    let mut last_heartbeat = Instant::now();

    // Counts attempts, not successful sends: a frame that fails to decode
    // still consumes an id.
    let mut frame_id: u64 = 0;
    let mut loop_iteration: u64 = 0;

    'sweeps: while running.load(Ordering::SeqCst) {
        for path in images {
            if !running.load(Ordering::SeqCst) {
                break 'sweeps;
            }

            flush_pending(&mut pending, monitor, publisher, stats);

            let id = frame_id;
            frame_id += 1;

            let frame = match frames::canonical_png(path) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("skipping {}: {:#}", path.display(), err);
                    continue;
                }
            };
            if frame.png.len() > MAX_ENVELOPE_BYTES {
                warn!(
                    "encoded frame {} is {} bytes (cap {}); skipping {}",
                    id,
                    frame.png.len(),
                    MAX_ENVELOPE_BYTES,
                    path.display()
                );
                continue;
            }

            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let header = FrameHeader {
                frame_id: id,
                loop_iteration,
                timestamp: now_iso8601(),
                filename,
                width: frame.width,
                height: frame.height,
                channels: frame.channels,
                encoding: "png".to_string(),
                bytes: frame.png.len() as u64,
            };
            let envelope = FrameEnvelope {
                header_json: serde_json::to_string(&header)
                    .context("failed to serialize frame header")?,
                image: frame.png,
            };
            debug!("header: {}", envelope.header_json);

            if !monitor.has_subscriber() {
                enqueue(&mut pending, envelope, id);
                std::thread::sleep(NO_SUBSCRIBER_BACKOFF);
            } else {
                match send_parts(publisher, &envelope.parts()) {
                    Ok(()) => {
                        stats.frames_sent += 1;
                        info!("published frame {} ({} bytes)", id, header.bytes);
                    }
                    Err(zmq::Error::EAGAIN) => {
                        warn!("publish would block on {}", config.pub_endpoint);
                        enqueue(&mut pending, envelope, id);
                        std::thread::sleep(NO_SUBSCRIBER_BACKOFF);
                    }
                    Err(err) => {
                        error!("failed to publish frame {}: {}", id, err);
                        bail!("bus send failed: {err}");
                    }
                }
            }

            if last_heartbeat.elapsed() >= heartbeat {
                info!(
                    "heartbeat: {} frames sent, loop iteration {}, {} pending",
                    stats.frames_sent,
                    loop_iteration,
                    pending.len()
                );
                last_heartbeat = Instant::now();
            }

            if !loop_delay.is_zero() {
                std::thread::sleep(loop_delay);
            }
        }

        if args.once {
            break;
        }
        loop_iteration += 1;
    }

    // Pending entries left at shutdown are dropped; every input is
    // re-readable from the source directory.
    Ok(())
}

fn effective_queue_depth(configured: usize) -> usize {
    if configured == 0 {
        warn!("IMAGE_GENERATOR_QUEUE_DEPTH=0 is invalid; using default 100");
        100
    } else {
        configured
    }
}

fn enqueue(pending: &mut PendingQueue<FrameEnvelope>, envelope: FrameEnvelope, frame_id: u64) {
    if pending.push(envelope).is_some() {
        warn!("pending queue full ({} frames); dropped oldest", pending.capacity());
    }
    warn!("queued frame {} until a subscriber appears", frame_id);
}

fn flush_pending(
    pending: &mut PendingQueue<FrameEnvelope>,
    monitor: &SubscriberMonitor,
    publisher: &zmq::Socket,
    stats: &mut SweepStats,
) {
    if pending.is_empty() {
        return;
    }
    let flushed = pending.flush_while(
        || monitor.has_subscriber(),
        |envelope| match send_parts(publisher, &envelope.parts()) {
            Ok(()) => true,
            Err(zmq::Error::EAGAIN) => false,
            Err(err) => {
                error!("failed to flush queued frame: {}", err);
                false
            }
        },
    );
    if flushed > 0 {
        stats.frames_sent += flushed as u64;
        info!("flushed {} queued frames to new subscriber", flushed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_depth_zero_falls_back_to_default() {
        assert_eq!(effective_queue_depth(0), 100);
        assert_eq!(effective_queue_depth(3), 3);
    }

    #[test]
    fn cli_accepts_documented_flags() {
        let args =
            Args::try_parse_from(["framecast-generator", "--once", "--log-level", "debug"])
                .unwrap();
        assert!(args.once);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.env.is_none());
    }
}
