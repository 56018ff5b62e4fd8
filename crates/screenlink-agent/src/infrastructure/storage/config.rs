//! TOML-based configuration persistence for the agent.
//!
//! Reads and writes `AgentConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\ScreenLink\agent.toml`
//! - Linux:    `~/.config/screenlink/agent.toml`
//! - macOS:    `~/Library/Application Support/ScreenLink/agent.toml`
//!
//! Every tuning knob of the connection subsystem has a default matching the
//! shipped kiosk image, so a missing or partial file is never an error —
//! fields absent from the TOML fall back via `#[serde(default = "...")]`,
//! which also keeps old config files working after upgrades.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use screenlink_core::{
    BackoffConfig, CadenceConfig, CircuitBreakerConfig, HealthConfig, QualityLevel,
    StabilityConfig,
};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level agent configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: GeneralConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub network: NetworkWatchConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

/// General agent behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Human-readable device name reported during authentication.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Relay endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// WebSocket URL of the relay's device endpoint.
    #[serde(default = "default_relay_url")]
    pub url: String,
    /// Seconds to wait for the WebSocket handshake before giving up.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Debounce and stability windows for the network observer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkWatchConfig {
    /// Milliseconds a network gain must hold before it is published.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Milliseconds a published connection must hold before it counts as stable.
    #[serde(default = "default_stability_ms")]
    pub stability_ms: u64,
}

/// Heartbeat cadence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeats in the foreground.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    /// Seconds to wait for an acknowledgement before the session is dead.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,
}

/// Reconnection backoff and circuit-breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    /// Seconds for the first retry delay; doubles per attempt.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    /// Cap on the retry delay in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Consecutive failures that trip the circuit breaker.
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,
    /// Seconds the circuit stays open before a half-open probe.
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
}

/// Streaming pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingConfig {
    /// Maximum frames waiting for transmission before eviction kicks in.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Quality level used until the first health snapshot arrives:
    /// `"low"`, `"medium"`, `"high"`, `"ultra"`.
    #[serde(default = "default_initial_quality")]
    pub initial_quality: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_name() -> String {
    "kiosk".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_relay_url() -> String {
    "ws://127.0.0.1:9770/device".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_debounce_ms() -> u64 {
    2000
}
fn default_stability_ms() -> u64 {
    3000
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_heartbeat_timeout_secs() -> u64 {
    10
}
fn default_initial_delay_secs() -> u64 {
    1
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_circuit_threshold() -> u32 {
    5
}
fn default_circuit_cooldown_secs() -> u64 {
    300
}
fn default_queue_capacity() -> usize {
    5
}
fn default_initial_quality() -> String {
    "medium".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for NetworkWatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            stability_ms: default_stability_ms(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            circuit_threshold: default_circuit_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            initial_quality: default_initial_quality(),
        }
    }
}

// ── Conversions into core configs ─────────────────────────────────────────────

impl NetworkWatchConfig {
    pub fn to_stability_config(&self) -> StabilityConfig {
        StabilityConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            stability_window: Duration::from_millis(self.stability_ms),
        }
    }
}

impl HeartbeatConfig {
    pub fn to_cadence_config(&self) -> CadenceConfig {
        CadenceConfig {
            heartbeat_interval: Duration::from_secs(self.interval_secs),
            heartbeat_timeout: Duration::from_secs(self.timeout_secs),
            ..CadenceConfig::default()
        }
    }
}

impl ReconnectConfig {
    pub fn to_backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs(self.initial_delay_secs),
            max: Duration::from_secs(self.max_delay_secs),
            ..BackoffConfig::default()
        }
    }

    pub fn to_circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_threshold,
            cooldown: Duration::from_secs(self.circuit_cooldown_secs),
        }
    }
}

impl StreamingConfig {
    /// Parses the configured quality level, falling back to Medium on an
    /// unrecognised value rather than refusing to start.
    pub fn initial_quality_level(&self) -> QualityLevel {
        match self.initial_quality.to_ascii_lowercase().as_str() {
            "low" => QualityLevel::Low,
            "medium" => QualityLevel::Medium,
            "high" => QualityLevel::High,
            "ultra" => QualityLevel::Ultra,
            _ => QualityLevel::Medium,
        }
    }
}

impl AgentConfig {
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.connect_timeout_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for agent files.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("agent.toml"))
}

/// Loads `AgentConfig` from disk, returning `AgentConfig::default()` if the
/// file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    let path = config_file_path()?;

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let cfg: AgentConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AgentConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Persists `config` to disk.
///
/// Creates the config directory and file if they do not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AgentConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;

    // Ensure directory exists before writing.
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory including the `ScreenLink`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        // %APPDATA% e.g. C:\Users\<user>\AppData\Roaming
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("ScreenLink"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("screenlink"))
    }

    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/ScreenLink
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("ScreenLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        // Fallback for unsupported platforms.
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_agent_config_default_matches_kiosk_image() {
        // Arrange / Act
        let cfg = AgentConfig::default();

        // Assert
        assert_eq!(cfg.relay.connect_timeout_secs, 10);
        assert_eq!(cfg.network.debounce_ms, 2000);
        assert_eq!(cfg.network.stability_ms, 3000);
        assert_eq!(cfg.heartbeat.interval_secs, 30);
        assert_eq!(cfg.heartbeat.timeout_secs, 10);
        assert_eq!(cfg.reconnect.circuit_threshold, 5);
        assert_eq!(cfg.reconnect.circuit_cooldown_secs, 300);
        assert_eq!(cfg.streaming.queue_capacity, 5);
    }

    #[test]
    fn test_default_log_level_is_info() {
        let cfg = GeneralConfig::default();
        assert_eq!(cfg.log_level, "info");
    }

    // ── TOML round-trip ───────────────────────────────────────────────────────

    #[test]
    fn test_agent_config_serializes_and_deserializes_round_trip() {
        // Arrange
        let mut cfg = AgentConfig::default();
        cfg.relay.url = "wss://relay.example.net/device".to_string();
        cfg.reconnect.max_delay_secs = 120;

        // Act
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: AgentConfig = toml::from_str(&toml_str).expect("deserialize");

        // Assert
        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        // Arrange / Act
        let cfg: AgentConfig = toml::from_str("").expect("deserialize empty");

        // Assert
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn test_deserialize_partial_section_keeps_other_defaults() {
        // Arrange
        let toml_str = r#"
[reconnect]
initial_delay_secs = 2
"#;

        // Act
        let cfg: AgentConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.reconnect.initial_delay_secs, 2);
        assert_eq!(cfg.reconnect.max_delay_secs, 60);
        assert_eq!(cfg.heartbeat.interval_secs, 30);
    }

    #[test]
    fn test_deserialize_invalid_toml_returns_parse_error() {
        let result: Result<AgentConfig, toml::de::Error> = toml::from_str("[[[ not valid toml");
        assert!(result.is_err());
    }

    // ── Conversions ───────────────────────────────────────────────────────────

    #[test]
    fn test_network_section_converts_to_stability_config() {
        let mut section = NetworkWatchConfig::default();
        section.debounce_ms = 1500;
        section.stability_ms = 4000;

        let stability = section.to_stability_config();

        assert_eq!(stability.debounce, Duration::from_millis(1500));
        assert_eq!(stability.stability_window, Duration::from_millis(4000));
    }

    #[test]
    fn test_reconnect_section_converts_to_backoff_and_circuit() {
        let section = ReconnectConfig::default();

        let backoff = section.to_backoff_config();
        let circuit = section.to_circuit_config();

        assert_eq!(backoff.initial, Duration::from_secs(1));
        assert_eq!(backoff.max, Duration::from_secs(60));
        assert_eq!(circuit.failure_threshold, 5);
        assert_eq!(circuit.cooldown, Duration::from_secs(300));
    }

    #[test]
    fn test_initial_quality_parses_known_levels() {
        let mut section = StreamingConfig::default();

        section.initial_quality = "Ultra".to_string();
        assert_eq!(section.initial_quality_level(), QualityLevel::Ultra);

        section.initial_quality = "low".to_string();
        assert_eq!(section.initial_quality_level(), QualityLevel::Low);
    }

    #[test]
    fn test_initial_quality_falls_back_to_medium_on_garbage() {
        let mut section = StreamingConfig::default();
        section.initial_quality = "potato".to_string();
        assert_eq!(section.initial_quality_level(), QualityLevel::Medium);
    }

    // ── Paths ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_config_file_path_ends_with_agent_toml() {
        if let Ok(path) = config_file_path() {
            assert!(
                path.ends_with("agent.toml"),
                "config file must be named agent.toml, got {path:?}"
            );
        }
        // NoPlatformConfigDir in a stripped CI env is also acceptable.
    }

    #[test]
    fn test_save_and_load_round_trip_via_temp_dir() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("screenlink_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("agent.toml");

        let mut cfg = AgentConfig::default();
        cfg.relay.url = "wss://relay.test/device".to_string();
        cfg.agent.log_level = "debug".to_string();

        // Act – serialize and write manually (mirrors save_config logic)
        let content = toml::to_string_pretty(&cfg).unwrap();
        std::fs::write(&path, &content).unwrap();
        let loaded: AgentConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        // Assert
        assert_eq!(loaded.relay.url, "wss://relay.test/device");
        assert_eq!(loaded.agent.log_level, "debug");

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }
}
