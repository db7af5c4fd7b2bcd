//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::DeviceConfig;
use crate::services::filter::FilterParams;
use crate::services::tunables::{self, CommandError, Tunables};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Room this receiver reports for; part of the control topics
    #[serde(default = "default_room")]
    pub room: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { room: default_room() }
    }
}

fn default_room() -> String {
    "room".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_enabled")]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic prefix for rooms/ and settings/ subtrees
    #[serde(default = "default_mqtt_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: default_mqtt_enabled(),
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            prefix: default_mqtt_prefix(),
            client_id: None,
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_enabled() -> bool {
    true
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_prefix() -> String {
    "espresense".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listener_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listener_bind")]
    pub bind_address: String,
    #[serde(default = "default_listener_port")]
    pub port: u16,
    /// Advertisements buffered between the socket readers and the collection
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: default_listener_enabled(),
            bind_address: default_listener_bind(),
            port: default_listener_port(),
            queue_size: default_queue_size(),
        }
    }
}

fn default_listener_enabled() -> bool {
    true
}

fn default_listener_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_listener_port() -> u16 {
    25804
}

fn default_queue_size() -> usize {
    1000
}

/// Startup values for the runtime tunables; names match the command names
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub max_distance: f64,
    pub absorption: f64,
    pub ref_rssi: i32,
    pub skip_distance: f64,
    pub forget_ms: u64,
    pub skip_ms: u64,
    pub close_ms: u64,
    pub count_ms: u64,
    pub count_enter: f64,
    pub count_exit: f64,
    pub include: String,
    pub exclude: String,
    pub query: String,
    pub known_macs: String,
    pub known_irks: String,
    pub count_ids: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_distance: tunables::DEFAULT_MAX_DISTANCE,
            absorption: crate::services::distance::DEFAULT_ABSORPTION,
            ref_rssi: tunables::DEFAULT_REF_RSSI,
            skip_distance: tunables::DEFAULT_SKIP_DISTANCE,
            forget_ms: tunables::DEFAULT_FORGET_MS,
            skip_ms: tunables::DEFAULT_SKIP_MS,
            close_ms: tunables::DEFAULT_CLOSE_MS,
            count_ms: tunables::DEFAULT_COUNT_MS,
            count_enter: tunables::DEFAULT_COUNT_ENTER,
            count_exit: tunables::DEFAULT_COUNT_EXIT,
            include: String::new(),
            exclude: String::new(),
            query: String::new(),
            known_macs: String::new(),
            known_irks: String::new(),
            count_ids: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntervalsConfig {
    /// Housekeeping sweep period
    #[serde(default = "default_cleanup_ms")]
    pub cleanup_ms: u64,
    /// Period of the fingerprint report log
    #[serde(default = "default_report_secs")]
    pub report_secs: u64,
    #[serde(default = "default_metrics_secs")]
    pub metrics_secs: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            cleanup_ms: default_cleanup_ms(),
            report_secs: default_report_secs(),
            metrics_secs: default_metrics_secs(),
        }
    }
}

fn default_cleanup_ms() -> u64 {
    1000
}

fn default_report_secs() -> u64 {
    10
}

fn default_metrics_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub filter: FilterParams,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    room: String,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_prefix: String,
    mqtt_client_id: Option<String>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    listener_enabled: bool,
    listener_bind_address: String,
    listener_port: u16,
    listener_queue_size: usize,
    tracking: TrackingConfig,
    filter: FilterParams,
    cleanup_ms: u64,
    report_secs: u64,
    metrics_secs: u64,
    devices: Vec<DeviceConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            room: toml_config.site.room,
            mqtt_enabled: toml_config.mqtt.enabled,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_prefix: toml_config.mqtt.prefix.trim_end_matches('/').to_string(),
            mqtt_client_id: toml_config.mqtt.client_id,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            listener_enabled: toml_config.listener.enabled,
            listener_bind_address: toml_config.listener.bind_address,
            listener_port: toml_config.listener.port,
            listener_queue_size: toml_config.listener.queue_size.max(1),
            tracking: toml_config.tracking,
            filter: toml_config.filter.sanitized(),
            cleanup_ms: toml_config.intervals.cleanup_ms.max(1),
            report_secs: toml_config.intervals.report_secs.max(1),
            metrics_secs: toml_config.intervals.metrics_secs.max(1),
            devices: toml_config.devices,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .tunables()
            .with_context(|| format!("Invalid [tracking] section in {}", path.display()))?;
        Ok(config)
    }

    /// Load from an explicit path, falling back to defaults with a warning
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Build the runtime tunables; rule strings are compiled and validated here
    pub fn tunables(&self) -> Result<Tunables, CommandError> {
        let t = &self.tracking;
        if t.count_enter >= t.count_exit {
            return Err(CommandError::CountOrder {
                command: "count_enter",
                enter: t.count_enter,
                exit: t.count_exit,
            });
        }

        let mut tunables = Tunables {
            skip_distance: t.skip_distance,
            max_distance: t.max_distance,
            absorption: t.absorption,
            ref_rssi: t.ref_rssi,
            forget_ms: t.forget_ms,
            skip_ms: t.skip_ms,
            close_ms: t.close_ms,
            count_ms: t.count_ms,
            count_enter: t.count_enter,
            count_exit: t.count_exit,
            filter: self.filter,
            ..Tunables::default()
        };
        for (command, value) in [
            ("include", &t.include),
            ("exclude", &t.exclude),
            ("query", &t.query),
            ("known_macs", &t.known_macs),
            ("known_irks", &t.known_irks),
            ("count_ids", &t.count_ids),
        ] {
            tunables.apply(command, value)?;
        }
        Ok(tunables)
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_prefix(&self) -> &str {
        &self.mqtt_prefix
    }

    /// Client id, defaulting to one derived from the room
    pub fn mqtt_client_id(&self) -> String {
        self.mqtt_client_id.clone().unwrap_or_else(|| format!("beacon-presence-{}", self.room))
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn listener_enabled(&self) -> bool {
        self.listener_enabled
    }

    pub fn listener_bind_address(&self) -> &str {
        &self.listener_bind_address
    }

    pub fn listener_port(&self) -> u16 {
        self.listener_port
    }

    pub fn listener_queue_size(&self) -> usize {
        self.listener_queue_size
    }

    pub fn filter(&self) -> FilterParams {
        self.filter
    }

    pub fn cleanup_ms(&self) -> u64 {
        self.cleanup_ms
    }

    pub fn report_secs(&self) -> u64 {
        self.report_secs
    }

    pub fn metrics_secs(&self) -> u64 {
        self.metrics_secs
    }

    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to override the tracking section
    #[cfg(test)]
    pub fn with_tracking(mut self, tracking: TrackingConfig) -> Self {
        self.tracking = tracking;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.room(), "room");
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.mqtt_prefix(), "espresense");
        assert_eq!(config.listener_port(), 25804);
        assert_eq!(config.cleanup_ms(), 1000);
        assert!(config.devices().is_empty());
        assert_eq!(config.mqtt_client_id(), "beacon-presence-room");
    }

    #[test]
    fn test_default_tunables_match_engine_defaults() {
        let tunables = Config::default().tunables().unwrap();
        let engine = Tunables::default();
        assert_eq!(tunables.max_distance, engine.max_distance);
        assert_eq!(tunables.ref_rssi, engine.ref_rssi);
        assert_eq!(tunables.forget_ms, engine.forget_ms);
        assert_eq!(tunables.count_exit, engine.count_exit);
        assert_eq!(tunables.filter, engine.filter);
        assert!(tunables.matcher.query.is_none());
    }

    #[test]
    fn test_tunables_rejects_bad_rules() {
        let tracking = TrackingConfig { query: "rssi >".to_string(), ..Default::default() };
        let config = Config::default().with_tracking(tracking);
        assert!(matches!(config.tunables(), Err(CommandError::Query(_))));

        let tracking = TrackingConfig { count_enter: 5.0, count_exit: 5.0, ..Default::default() };
        let config = Config::default().with_tracking(tracking);
        assert!(matches!(config.tunables(), Err(CommandError::CountOrder { .. })));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[site]
room = "kitchen"

[tracking]
max_distance = 8.0
include = "apple: tile:"
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.room(), "kitchen");
        let t = config.tunables().unwrap();
        assert_eq!(t.max_distance, 8.0);
        assert_eq!(t.skip_ms, tunables::DEFAULT_SKIP_MS);
        assert!(t.matcher.include.matches("tile:1234"));
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["beacon-presence".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "beacon-presence".to_string(),
            "--config".to_string(),
            "config/office.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/office.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["beacon-presence".to_string(), "--config=config/lab.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/lab.toml");
    }

    #[test]
    fn test_prefix_trailing_slash_trimmed() {
        let toml_config: TomlConfig = toml::from_str("[mqtt]\nprefix = \"home/ble/\"\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.mqtt_prefix(), "home/ble");
    }
}
