//! Framecast common library - shared plumbing for the imaging pipeline
//!
//! This crate carries everything the three pipeline stages share:
//!
//! - The multipart envelope contract between generator, extractor, and logger
//! - The dotenv-style configuration loader and per-stage config structs
//! - PUB/SUB socket setup with bind/connect retry and part-wise receive
//! - The subscriber-presence monitor backed by socket lifecycle events
//! - The bounded pending queue used for backpressure on both publishers
//! - Small utilities: UTC timestamps, shutdown signal wiring, log setup

pub mod bus;
pub mod config;
pub mod env;
pub mod envelope;
pub mod monitor;
pub mod queue;
pub mod util;

// Re-export main types
pub use bus::{bind_with_retry, connect_with_retry, recv_envelope, send_parts, BusError, RecvOutcome};
pub use config::{
    load_app_config, resolve_env_path, AppConfig, ExtractorConfig, GeneratorConfig, GlobalConfig,
    LoggerConfig,
};
pub use env::{EnvError, EnvFile};
pub use envelope::{
    FrameEnvelope, FrameHeader, KeypointRecord, ProcessedFrame, ProcessedHeader, MAX_ENVELOPE_BYTES,
};
pub use monitor::SubscriberMonitor;
pub use queue::PendingQueue;
pub use util::{init_logging, install_shutdown_handlers, level_from_str, now_iso8601};
