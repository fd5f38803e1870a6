//! Per-stage configuration with defaults and path resolution.
//!
//! Every option comes from the shared environment file; unknown or
//! malformed values fall back to their defaults so a partial file is
//! always usable. Relative paths resolve against the directory the
//! stage was started from.

use crate::env::EnvFile;
use std::path::{Path, PathBuf};

/// Options shared by every stage
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Log level (trace, debug, info, warn, error, critical)
    pub log_level: String,
}

/// Frame generator options
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Directory enumerated for input images
    pub input_dir: PathBuf,
    /// Sleep between published frames in milliseconds
    pub loop_delay_ms: u64,
    /// Unconditional warmup sleep after binding
    pub start_delay_ms: u64,
    /// Maximum wait for the first subscriber
    pub subscriber_wait_ms: u64,
    /// Endpoint the PUB socket binds on
    pub pub_endpoint: String,
    /// Heartbeat log cadence in milliseconds
    pub heartbeat_ms: u64,
    /// Pending queue bound while no subscriber is connected
    pub queue_depth: usize,
}

/// Feature extractor options
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Endpoint the upstream SUB socket connects to
    pub sub_endpoint: String,
    /// Endpoint the downstream PUB socket binds on
    pub pub_endpoint: String,
    /// Detector feature cap (0 = unlimited)
    pub sift_n_features: usize,
    /// Detector contrast threshold
    pub sift_contrast_threshold: f64,
    /// Detector edge-response threshold
    pub sift_edge_threshold: f64,
    /// Pending queue bound while the logger is absent
    pub queue_depth: usize,
}

/// Data logger options
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Endpoint the ingress SUB socket connects to
    pub sub_endpoint: String,
    /// SQLite database path
    pub db_path: PathBuf,
    /// Directory for raw frame PNGs
    pub raw_image_dir: PathBuf,
    /// Directory for annotated overlay PNGs
    pub annotated_dir: PathBuf,
}

/// Full pipeline configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub global: GlobalConfig,
    pub generator: GeneratorConfig,
    pub extractor: ExtractorConfig,
    pub logger: LoggerConfig,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_depth() -> usize {
    100
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("./data/images"),
            loop_delay_ms: 100,
            start_delay_ms: 500,
            subscriber_wait_ms: 1000,
            pub_endpoint: "tcp://127.0.0.1:5555".to_string(),
            heartbeat_ms: 2000,
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            sub_endpoint: "tcp://127.0.0.1:5555".to_string(),
            pub_endpoint: "tcp://127.0.0.1:5556".to_string(),
            sift_n_features: 0,
            sift_contrast_threshold: 0.04,
            sift_edge_threshold: 10.0,
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            sub_endpoint: "tcp://127.0.0.1:5556".to_string(),
            db_path: PathBuf::from("./storage/framecast.sqlite"),
            raw_image_dir: PathBuf::from("./storage/raw_frames"),
            annotated_dir: PathBuf::from("./storage/annotated_frames"),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            generator: GeneratorConfig::default(),
            extractor: ExtractorConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

fn to_u64(env: &EnvFile, key: &str, fallback: u64) -> u64 {
    env.get(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

fn to_usize(env: &EnvFile, key: &str, fallback: usize) -> usize {
    env.get(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

fn to_f64(env: &EnvFile, key: &str, fallback: f64) -> f64 {
    env.get(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

fn to_path(env: &EnvFile, key: &str, fallback: &Path, root: &Path) -> PathBuf {
    let candidate = env.get(key).map(PathBuf::from).unwrap_or_else(|| fallback.to_path_buf());
    if candidate.is_relative() {
        root.join(candidate)
    } else {
        candidate
    }
}

/// Resolve the environment file path: CLI flag, then the `DIST_ENV_PATH`
/// variable, then `<root>/.env`.
pub fn resolve_env_path(cli_path: Option<&Path>, root: &Path) -> PathBuf {
    if let Some(path) = cli_path {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("DIST_ENV_PATH") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    root.join(".env")
}

/// Build the full configuration from an environment file, resolving
/// relative paths against `root_dir`.
pub fn load_app_config(env: &EnvFile, root_dir: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();

    cfg.global.log_level = env.get_or("APP_LOG_LEVEL", &cfg.global.log_level);

    cfg.generator.input_dir =
        to_path(env, "IMAGE_GENERATOR_INPUT_DIR", &cfg.generator.input_dir, root_dir);
    cfg.generator.loop_delay_ms =
        to_u64(env, "IMAGE_GENERATOR_LOOP_DELAY_MS", cfg.generator.loop_delay_ms);
    cfg.generator.start_delay_ms =
        to_u64(env, "IMAGE_GENERATOR_START_DELAY_MS", cfg.generator.start_delay_ms);
    cfg.generator.subscriber_wait_ms = to_u64(
        env,
        "IMAGE_GENERATOR_SUBSCRIBER_WAIT_MS",
        cfg.generator.subscriber_wait_ms,
    );
    cfg.generator.pub_endpoint =
        env.get_or("IMAGE_GENERATOR_PUB_ENDPOINT", &cfg.generator.pub_endpoint);
    cfg.generator.heartbeat_ms =
        to_u64(env, "IMAGE_GENERATOR_HEARTBEAT_MS", cfg.generator.heartbeat_ms);
    // The generator falls back to the extractor's depth before the default so
    // one knob can bound both queues.
    let extractor_depth_fallback =
        to_usize(env, "FEATURE_EXTRACTOR_QUEUE_DEPTH", cfg.generator.queue_depth);
    cfg.generator.queue_depth =
        to_usize(env, "IMAGE_GENERATOR_QUEUE_DEPTH", extractor_depth_fallback);

    cfg.extractor.sub_endpoint =
        env.get_or("FEATURE_EXTRACTOR_SUB_ENDPOINT", &cfg.extractor.sub_endpoint);
    cfg.extractor.pub_endpoint =
        env.get_or("FEATURE_EXTRACTOR_PUB_ENDPOINT", &cfg.extractor.pub_endpoint);
    cfg.extractor.sift_n_features =
        to_usize(env, "FEATURE_EXTRACTOR_SIFT_N_FEATURES", cfg.extractor.sift_n_features);
    cfg.extractor.sift_contrast_threshold = to_f64(
        env,
        "FEATURE_EXTRACTOR_SIFT_CONTRAST_THRESHOLD",
        cfg.extractor.sift_contrast_threshold,
    );
    cfg.extractor.sift_edge_threshold = to_f64(
        env,
        "FEATURE_EXTRACTOR_SIFT_EDGE_THRESHOLD",
        cfg.extractor.sift_edge_threshold,
    );
    cfg.extractor.queue_depth =
        to_usize(env, "FEATURE_EXTRACTOR_QUEUE_DEPTH", cfg.extractor.queue_depth);

    cfg.logger.sub_endpoint = env.get_or("DATA_LOGGER_SUB_ENDPOINT", &cfg.logger.sub_endpoint);
    cfg.logger.db_path = to_path(env, "DATA_LOGGER_DB_PATH", &cfg.logger.db_path, root_dir);
    cfg.logger.raw_image_dir =
        to_path(env, "DATA_LOGGER_RAW_IMAGE_DIR", &cfg.logger.raw_image_dir, root_dir);
    cfg.logger.annotated_dir =
        to_path(env, "DATA_LOGGER_ANNOTATED_DIR", &cfg.logger.annotated_dir, root_dir);

    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_env_yields_defaults() {
        let env = EnvFile::parse("");
        let root = Path::new("/srv/framecast");
        let cfg = load_app_config(&env, root);

        assert_eq!(cfg.global.log_level, "info");
        assert_eq!(cfg.generator.loop_delay_ms, 100);
        assert_eq!(cfg.generator.start_delay_ms, 500);
        assert_eq!(cfg.generator.subscriber_wait_ms, 1000);
        assert_eq!(cfg.generator.heartbeat_ms, 2000);
        assert_eq!(cfg.generator.queue_depth, 100);
        assert_eq!(cfg.generator.pub_endpoint, "tcp://127.0.0.1:5555");
        assert_eq!(cfg.extractor.sub_endpoint, "tcp://127.0.0.1:5555");
        assert_eq!(cfg.extractor.pub_endpoint, "tcp://127.0.0.1:5556");
        assert_eq!(cfg.extractor.sift_n_features, 0);
        assert!((cfg.extractor.sift_contrast_threshold - 0.04).abs() < 1e-9);
        assert!((cfg.extractor.sift_edge_threshold - 10.0).abs() < 1e-9);
        assert_eq!(cfg.logger.sub_endpoint, "tcp://127.0.0.1:5556");
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        let env = EnvFile::parse("IMAGE_GENERATOR_INPUT_DIR=frames\n");
        let cfg = load_app_config(&env, Path::new("/srv/framecast"));
        assert_eq!(cfg.generator.input_dir, PathBuf::from("/srv/framecast/frames"));
        assert_eq!(
            cfg.logger.raw_image_dir,
            PathBuf::from("/srv/framecast/./storage/raw_frames")
        );
    }

    #[test]
    fn absolute_paths_pass_through() {
        let env = EnvFile::parse("DATA_LOGGER_DB_PATH=/var/lib/framecast/frames.sqlite\n");
        let cfg = load_app_config(&env, Path::new("/srv/framecast"));
        assert_eq!(cfg.logger.db_path, PathBuf::from("/var/lib/framecast/frames.sqlite"));
    }

    #[test]
    fn malformed_integers_fall_back_to_defaults() {
        let env = EnvFile::parse(
            "IMAGE_GENERATOR_LOOP_DELAY_MS=fast\nFEATURE_EXTRACTOR_SIFT_EDGE_THRESHOLD=steep\n",
        );
        let cfg = load_app_config(&env, Path::new("/"));
        assert_eq!(cfg.generator.loop_delay_ms, 100);
        assert!((cfg.extractor.sift_edge_threshold - 10.0).abs() < 1e-9);
    }

    #[test]
    fn generator_queue_depth_falls_back_to_extractor_key() {
        let env = EnvFile::parse("FEATURE_EXTRACTOR_QUEUE_DEPTH=7\n");
        let cfg = load_app_config(&env, Path::new("/"));
        assert_eq!(cfg.generator.queue_depth, 7);
        assert_eq!(cfg.extractor.queue_depth, 7);

        let env = EnvFile::parse("IMAGE_GENERATOR_QUEUE_DEPTH=3\nFEATURE_EXTRACTOR_QUEUE_DEPTH=7\n");
        let cfg = load_app_config(&env, Path::new("/"));
        assert_eq!(cfg.generator.queue_depth, 3);
    }

    #[test]
    fn cli_flag_wins_env_path_resolution() {
        let root = Path::new("/srv/framecast");
        let flag = PathBuf::from("/etc/framecast.env");
        assert_eq!(resolve_env_path(Some(flag.as_path()), root), flag);
        // Without a flag or DIST_ENV_PATH the default sits next to the root.
        if std::env::var("DIST_ENV_PATH").is_err() {
            assert_eq!(resolve_env_path(None, root), root.join(".env"));
        }
    }
}
