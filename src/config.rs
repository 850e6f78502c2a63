//! Gateway Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/gateway.toml`)
//! 2. Environment variables prefixed with `GATEWAY_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use telemetry_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), telemetry_gateway::error::GatewayError>(())
//! ```
//!
//! Environment override example: `GATEWAY_SERIAL__BAUDRATE=115200`. USB ids from
//! the environment are read as hex text, the same as quoted ids in the TOML file.

use crate::error::{GatewayError, GatewayResult};
use crate::transport::discovery::UsbId;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

/// Keys whose environment values are kept as strings. `Env` would turn `7523`
/// into a decimal integer.
const USB_ID_KEYS: [&str; 2] = ["serial.vendor_id", "serial.product_id"];

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Which transport carries the summary messages
    #[serde(default)]
    pub transport: TransportConfig,
    /// Serial line and device discovery settings
    pub serial: SerialSettings,
    /// UDP listener settings
    pub udp: UdpSettings,
    /// Orchestration loop settings
    #[serde(default)]
    pub gateway: LoopSettings,
    /// Archival persistence settings
    #[serde(default)]
    pub storage: StorageSettings,
    /// Logical channels, one buffer each
    pub channels: Vec<ChannelConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Physical serial port found by USB vendor/product id.
    #[default]
    Serial,
    /// Standard input/output stand-in.
    Console,
}

/// Transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport variant to construct at startup
    #[serde(default)]
    pub kind: TransportKind,
}

/// What happens to a message whose write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// The failed message is discarded.
    #[default]
    AtMostOnce,
    /// The failed message is written again first after reconnecting.
    AtLeastOnce,
}

/// Serial port settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// USB vendor id, hex string or integer
    pub vendor_id: UsbId,
    /// USB product id, hex string or integer
    pub product_id: UsbId,
    /// Baud rate
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Data bits per character (5-8)
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// Parity: "N", "E" or "O"
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    /// Fixed delay between reconnect attempts
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// How often the reader re-checks a disconnected link
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reader_poll_interval: Duration,
    /// Delivery semantics for a message whose write failed
    #[serde(default)]
    pub delivery: DeliveryPolicy,
    /// Program executed when a reboot command arrives over the serial link
    #[serde(default = "default_reboot_command")]
    pub reboot_command: PathBuf,
}

/// UDP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpSettings {
    /// Address to bind
    pub ip_address: String,
    /// Port to bind
    pub port: u16,
    /// Liveness file rewritten after each received datagram
    pub udp_last_seen_file: PathBuf,
    /// Give up binding after this long
    #[serde(default = "default_startup_timeout", with = "humantime_serde")]
    pub startup_timeout: Duration,
    /// Delay between bind attempts
    #[serde(default = "default_bind_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl UdpSettings {
    /// `ip:port` string for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

/// Orchestration loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSettings {
    /// How often buffers are checked for readiness when no datagram arrives
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
        }
    }
}

/// Archival storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// CSV archive path; archival is disabled when unset
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
}

/// A logical channel definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel identifier as it appears in datagrams
    pub id: String,
    /// Flush interval for this channel
    #[serde(with = "humantime_serde")]
    pub averaging_window: Duration,
}

// Default value functions
fn default_name() -> String {
    "Telemetry Gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_baudrate() -> u32 {
    9600
}

fn default_bytesize() -> u8 {
    8
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stopbits() -> u8 {
    1
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_reboot_command() -> PathBuf {
    PathBuf::from("/usr/local/bin/rsh-reboot")
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_bind_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

impl GatewayConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> GatewayResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        Self::from_figment(with_env_overrides(
            Figment::new().merge(Toml::file(path.as_ref())),
        ))
    }

    /// Extract and validate configuration from an assembled figment.
    pub fn from_figment(figment: Figment) -> GatewayResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> GatewayResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(GatewayError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(GatewayError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.channels.is_empty() {
            return Err(GatewayError::Configuration(
                "At least one channel must be configured".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if channel.id.is_empty() {
                return Err(GatewayError::Configuration(
                    "Channel id must not be empty".to_string(),
                ));
            }
            if !ids.insert(channel.id.as_str()) {
                return Err(GatewayError::Configuration(format!(
                    "Duplicate channel id: {}",
                    channel.id
                )));
            }
        }

        if self.gateway.flush_interval.is_zero() {
            return Err(GatewayError::Configuration(
                "gateway.flush_interval must be positive".to_string(),
            ));
        }

        self.serial.validate()
    }
}

/// Merge `GATEWAY_` environment variables over `figment`.
pub fn with_env_overrides(figment: Figment) -> Figment {
    let env = Env::prefixed("GATEWAY_").split("__");
    let usb_ids = env.clone().only(&USB_ID_KEYS);
    usb_ids.iter().fold(
        figment.merge(env.ignore(&USB_ID_KEYS)),
        |figment, (key, value)| figment.merge(Serialized::default(key.as_str(), value)),
    )
}

impl SerialSettings {
    /// Check line parameters and USB ids.
    pub fn validate(&self) -> GatewayResult<()> {
        self.vendor_id.value()?;
        self.product_id.value()?;

        if self.baudrate == 0 {
            return Err(GatewayError::Configuration(
                "baudrate must be positive".to_string(),
            ));
        }
        if !(5..=8).contains(&self.bytesize) {
            return Err(GatewayError::Configuration(format!(
                "Invalid bytesize {}. Must be 5-8",
                self.bytesize
            )));
        }
        if !matches!(self.parity.to_uppercase().as_str(), "N" | "E" | "O") {
            return Err(GatewayError::Configuration(format!(
                "Invalid parity '{}'. Must be one of: N, E, O",
                self.parity
            )));
        }
        if !matches!(self.stopbits, 1 | 2) {
            return Err(GatewayError::Configuration(format!(
                "Invalid stopbits {}. Must be 1 or 2",
                self.stopbits
            )));
        }
        Ok(())
    }
}
