//! Small shared utilities: timestamps, log setup, and shutdown wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Level;

/// Current UTC time formatted `YYYY-MM-DDTHH:MM:SSZ`, so log lines and
/// persisted rows align across processes.
pub fn now_iso8601() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Map a human-friendly level string onto a tracing level. `critical`
/// collapses onto `error` (tracing has nothing above it); unknown strings
/// fall back to `info`.
pub fn level_from_str(value: &str) -> Level {
    match value {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" | "critical" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global fmt subscriber at the given level.
pub fn init_logging(level: &str) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level_from_str(level))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}

/// Register interrupt/terminate handlers that flip `running` to `false`.
/// Every stage loop polls the flag at iteration boundaries.
pub fn install_shutdown_handlers(running: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
}
