//! Configuration for the relay server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/multiapi/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,

    /// Directory holding db.json
    pub data_dir: PathBuf,

    /// Directory holding debug capture session logs
    pub debug_log_dir: PathBuf,

    /// Deadline for outbound upstream calls, in seconds. 0 disables the
    /// deadline entirely (streaming sessions can legitimately run long).
    pub upstream_timeout_secs: u64,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is not set
    pub level: String,
    /// Whether to also write logs to rotating files
    pub file_enabled: bool,
    /// Directory for log files
    pub file_dir: PathBuf,
    /// Log file name prefix
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            file_dir: PathBuf::from("./logs"),
            file_prefix: "multiapi".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            data_dir: PathBuf::from("./data"),
            debug_log_dir: PathBuf::from("./data/debug_logs"),
            upstream_timeout_secs: 300,
            logging: LoggingConfig::default(),
        }
    }
}

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub data_dir: Option<String>,
    pub debug_log_dir: Option<String>,
    pub upstream_timeout_secs: Option<u64>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLogging {
    pub level: Option<String>,
    pub file_enabled: Option<bool>,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
}

impl Config {
    /// Get the config file path: ~/.config/multiapi/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("multiapi").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        if path.exists() {
            return;
        }

        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }

        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Render the configuration as a commented TOML template
    pub fn to_toml(&self) -> String {
        format!(
            r#"# multiapi configuration
# Values here are overridden by MULTIAPI_* environment variables.

# Address the relay listens on
bind_addr = "{bind_addr}"

# Directory holding db.json (saved upstream configurations)
data_dir = "{data_dir}"

# Directory holding debug capture session logs
debug_log_dir = "{debug_log_dir}"

# Deadline for outbound upstream calls in seconds; 0 disables it
upstream_timeout_secs = {timeout}

[logging]
# Default level when RUST_LOG is not set: trace, debug, info, warn, error
level = "{level}"
# Also write logs to rotating files
file_enabled = {file_enabled}
file_dir = "{file_dir}"
file_prefix = "{file_prefix}"
"#,
            bind_addr = self.bind_addr,
            data_dir = self.data_dir.display(),
            debug_log_dir = self.debug_log_dir.display(),
            timeout = self.upstream_timeout_secs,
            level = self.logging.level,
            file_enabled = self.logging.file_enabled,
            file_dir = self.logging.file_dir.display(),
            file_prefix = self.logging.file_prefix,
        )
    }

    /// Load file config if it exists
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    // Fatal - a broken config should fail fast with a clear
                    // error, not silently fall back to defaults
                    eprintln!("Failed to parse config file {}: {}", path.display(), e);
                    eprintln!("To reset, delete the file and restart multiapi.");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("Cannot read config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let defaults = Self::default();

        let bind_addr = match resolve_bind_addr(
            std::env::var("MULTIAPI_BIND").ok().or(file.bind_addr),
            defaults.bind_addr,
        ) {
            Ok(addr) => addr,
            Err(message) => {
                // Same fail-fast treatment as a broken config file: a typo'd
                // address should not silently fall back to the default
                eprintln!("{}", message);
                eprintln!("Set MULTIAPI_BIND (or bind_addr in the config file) to host:port.");
                std::process::exit(1);
            }
        };

        let data_dir = std::env::var("MULTIAPI_DATA_DIR")
            .ok()
            .or(file.data_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        // Debug log dir defaults to a subdirectory of the data dir unless
        // set explicitly
        let debug_log_dir = std::env::var("MULTIAPI_DEBUG_LOG_DIR")
            .ok()
            .or(file.debug_log_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("debug_logs"));

        let upstream_timeout_secs = std::env::var("MULTIAPI_UPSTREAM_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.upstream_timeout_secs)
            .unwrap_or(defaults.upstream_timeout_secs);

        let file_logging = file.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: file_logging.level.unwrap_or(defaults.logging.level),
            file_enabled: file_logging
                .file_enabled
                .unwrap_or(defaults.logging.file_enabled),
            file_dir: file_logging
                .file_dir
                .map(PathBuf::from)
                .unwrap_or(defaults.logging.file_dir),
            file_prefix: file_logging
                .file_prefix
                .unwrap_or(defaults.logging.file_prefix),
        };

        Self {
            bind_addr,
            data_dir,
            debug_log_dir,
            upstream_timeout_secs,
            logging,
        }
    }
}

/// Parse the configured bind address, falling back to the default when none
/// was given. Returns a printable message on bad input; the caller decides
/// how to fail.
fn resolve_bind_addr(
    value: Option<String>,
    default: SocketAddr,
) -> std::result::Result<SocketAddr, String> {
    match value {
        Some(s) => s
            .parse()
            .map_err(|e| format!("Invalid bind address {:?}: {}", s, e)),
        None => Ok(default),
    }
}
