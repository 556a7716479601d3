//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `DESKRELAY_LISTEN`, `DESKRELAY_GUACD_ADDRESS`,
//!    `DESKRELAY_RECORDING_PATH`
//! 2. **Config file** — path via `--config <path>`, or `deskrelay.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8088"
//! record_retention_secs = 3600
//! pending_ttl_secs = 300
//! sweep_interval_secs = 30
//!
//! [guacd]
//! address = "127.0.0.1:4822"
//! connect_timeout_secs = 5
//! handshake_timeout_secs = 15
//! max_frame_size = 8388608
//! dpi = 96
//! timezone = "UTC"
//! audio_mimetypes = ["audio/L8", "audio/L16"]
//! image_mimetypes = ["image/jpeg", "image/png", "image/webp"]
//! legacy_delimited_reads = false
//!
//! [guacd.parameters.rdp]                   # merged into every rdp connection
//! security = "any"
//! ignore-cert = "true"
//!
//! [recording]
//! enabled = false
//! path = "/var/lib/deskrelay/recordings"
//!
//! [logging]
//! level = "info"
//!
//! [[assets]]
//! id = "win-01"
//! name = "Build server"
//! protocol = "rdp"                         # rdp | vnc | ssh | telnet | kubernetes
//! hostname = "10.0.0.12"
//! username = "admin"
//! password = "secret"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::assets::Asset;
use crate::guac::instruction::{ReadMode, DEFAULT_MAX_FRAME_SIZE};
use crate::guac::{ClientInfo, TunnelOptions};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub guacd: GuacdConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// HTTP server and session-record housekeeping.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8088`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Keep closed session records this long (default 3600 s).
    #[serde(default = "default_record_retention")]
    pub record_retention_secs: u64,
    /// Drop records that were created but never opened (default 300 s).
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
    /// Interval of the record sweep task (default 30 s).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Where guacd lives and what the relay announces during handshakes.
#[derive(Debug, Clone, Deserialize)]
pub struct GuacdConfig {
    /// guacd `host:port` (default `127.0.0.1:4822`).
    #[serde(default = "default_guacd_address")]
    pub address: String,
    /// TCP connect timeout (default 5 s).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Bound on the whole select → ready exchange (default 15 s).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Largest instruction accepted from guacd, in bytes (default 8 MB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// DPI when the client does not send one (default 96).
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    /// Timezone announced to guacd (default `UTC`).
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_audio_mimetypes")]
    pub audio_mimetypes: Vec<String>,
    #[serde(default = "default_image_mimetypes")]
    pub image_mimetypes: Vec<String>,
    /// Split frames on `;` instead of element lengths, with the legacy
    /// audio rewrite. Only for guacd builds that need it (default false).
    #[serde(default)]
    pub legacy_delimited_reads: bool,
    /// Per-protocol parameters merged into every connection of that protocol.
    #[serde(default)]
    pub parameters: HashMap<String, HashMap<String, String>>,
}

/// Session recording (written by guacd, not by the relay).
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory on the guacd host (default `/var/lib/deskrelay/recordings`).
    #[serde(default = "default_recording_path")]
    pub path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8088".to_string()
}
fn default_record_retention() -> u64 {
    3600
}
fn default_pending_ttl() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_guacd_address() -> String {
    "127.0.0.1:4822".to_string()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_handshake_timeout() -> u64 {
    15
}
fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}
fn default_dpi() -> u32 {
    96
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_audio_mimetypes() -> Vec<String> {
    ClientInfo::default().audio_mimetypes
}
fn default_image_mimetypes() -> Vec<String> {
    ClientInfo::default().image_mimetypes
}
fn default_recording_path() -> String {
    "/var/lib/deskrelay/recordings".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            record_retention_secs: default_record_retention(),
            pending_ttl_secs: default_pending_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for GuacdConfig {
    fn default() -> Self {
        Self {
            address: default_guacd_address(),
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_frame_size: default_max_frame_size(),
            dpi: default_dpi(),
            timezone: default_timezone(),
            audio_mimetypes: default_audio_mimetypes(),
            image_mimetypes: default_image_mimetypes(),
            legacy_delimited_reads: false,
            parameters: HashMap::new(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_recording_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Closed-record retention in milliseconds, saturating on huge values.
    pub fn record_retention_ms(&self) -> u64 {
        self.record_retention_secs.saturating_mul(1000)
    }

    pub fn pending_ttl_ms(&self) -> u64 {
        self.pending_ttl_secs.saturating_mul(1000)
    }
}

impl GuacdConfig {
    pub fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            read_mode: if self.legacy_delimited_reads {
                ReadMode::Delimited
            } else {
                ReadMode::LengthPrefixed
            },
            max_frame_size: self.max_frame_size,
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `deskrelay.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::parse(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("deskrelay.toml").exists() {
            let content =
                std::fs::read_to_string("deskrelay.toml").expect("Failed to read deskrelay.toml");
            Self::parse(&content).expect("Failed to parse deskrelay.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("DESKRELAY_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(address) = std::env::var("DESKRELAY_GUACD_ADDRESS") {
            config.guacd.address = address;
        }
        if let Ok(path) = std::env::var("DESKRELAY_RECORDING_PATH") {
            config.recording.path = path;
        }

        config
    }

    /// Parse a TOML document and check asset ids are unique.
    pub fn parse(content: &str) -> Result<Self, String> {
        let config: Config = toml::from_str(content).map_err(|e| e.to_string())?;
        let mut seen = std::collections::HashSet::new();
        for asset in &config.assets {
            if !seen.insert(asset.id.as_str()) {
                return Err(format!("duplicate asset id {:?}", asset.id));
            }
        }
        Ok(config)
    }
}
