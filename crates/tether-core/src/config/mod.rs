//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: Hardcoded in struct `Default` implementations
//! 2. **Config file**: TOML file specified by `TETHER_CONFIG` env var
//! 3. **Environment variables**: `TETHER__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`ServerConfig`]: WebSocket + admin listener settings
//! - [`UplinkEntry`]: upstream ledger-node endpoint definitions per role
//! - [`LimitsConfig`]: per-IP ceilings, buffer and history caps
//! - [`TimeoutsConfig`]: the uplink/downstream timer set
//! - [`PenaltyConfig`]: endpoint penalty decay and trip threshold
//! - [`PolicyConfig`]: fee caps, disabled transaction types, limit ceiling
//! - [`AdvisoryConfig`]: external reputation / destination-tag feeds
//! - [`LoggingConfig`]: log level and format
//!
//! # Validation
//!
//! Configuration is validated at load time. Invalid configurations (e.g.
//! an empty uplink list, a zero buffer cap) return errors rather than
//! failing silently at the first client.

use crate::types::Role;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

/// Endpoint used when no healthy endpoint exists for a requested role.
pub const FALLBACK_ENDPOINT: &str = "wss://s2.ripple.com/#fallback";

/// Listener configuration for the proxy and its admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind both listeners to. Defaults to `127.0.0.1`.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// WebSocket listener port. Defaults to `4001`.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Admin HTTP listener port. Defaults to `bind_port + 1` semantics (`4002`).
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    4001
}

fn default_admin_port() -> u16 {
    4002
}

/// A single configured upstream ledger-node endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkEntry {
    /// Traffic class this endpoint serves.
    pub role: Role,

    /// WebSocket URL. Must start with `ws://` or `wss://`.
    pub url: String,

    /// Initial health flag; endpoints seeded unhealthy stay out of selection
    /// until an administrator marks them up. Defaults to `true`.
    #[serde(default = "default_true")]
    pub healthy: bool,
}

fn default_true() -> bool {
    true
}

/// Per-IP ceilings and the bounded-buffer caps that protect the process
/// from stuck clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent `basic`-class connections per client IP. Defaults to `8`.
    #[serde(default = "default_ip_basic")]
    pub ip_basic: usize,

    /// IPs exempt from the per-IP ceiling.
    #[serde(default)]
    pub ip_whitelist: Vec<String>,

    /// Cap on raw messages buffered while no uplink is open. Exceeding it is
    /// treated as a stuck client and closes both sockets. Defaults to `300`.
    #[serde(default = "default_message_buffer")]
    pub message_buffer: usize,

    /// Length of the recent-command ring replayed after a node-unsuitable
    /// reselect. Defaults to `10`.
    #[serde(default = "default_command_history")]
    pub command_history: usize,

    /// Maximum frame length inspected for the `__api` control envelope.
    /// Defaults to `1024`.
    #[serde(default = "default_control_frame_bytes")]
    pub control_frame_bytes: usize,

    /// Maximum frame length inspected for subscription bookkeeping on the
    /// uplink send path. Defaults to 1 MiB.
    #[serde(default = "default_subscription_register_bytes")]
    pub subscription_register_bytes: usize,
}

fn default_ip_basic() -> usize {
    8
}

fn default_message_buffer() -> usize {
    300
}

fn default_command_history() -> usize {
    10
}

fn default_control_frame_bytes() -> usize {
    1024
}

fn default_subscription_register_bytes() -> usize {
    1024 * 1024
}

/// The timer set driving both sides of the proxy, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Uplink transport connect deadline. Defaults to `7500`.
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Interval between uplink liveness probes. Defaults to `5000`.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Window in which any inbound uplink payload must arrive before the
    /// uplink is treated as gone. Defaults to `30000`.
    #[serde(default = "default_pong_window_ms")]
    pub pong_window_ms: u64,

    /// Delay before reconnecting after an uplink reports gone. Defaults to `2000`.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Downstream heartbeat ping interval; two missed heartbeats terminate
    /// the socket. Defaults to `15000`.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Deadline for a fresh uplink to produce its first inbound payload
    /// before it is discarded on purpose. Defaults to `10000`.
    #[serde(default = "default_first_contact_ms")]
    pub first_contact_ms: u64,

    /// Grace delay between downstream close and uplink teardown, letting
    /// in-flight sends complete. Defaults to `500`.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

fn default_connect_ms() -> u64 {
    7500
}

fn default_ping_interval_ms() -> u64 {
    5000
}

fn default_pong_window_ms() -> u64 {
    30_000
}

fn default_reconnect_backoff_ms() -> u64 {
    2000
}

fn default_heartbeat_ms() -> u64 {
    15_000
}

fn default_first_contact_ms() -> u64 {
    10_000
}

fn default_close_grace_ms() -> u64 {
    500
}

impl TimeoutsConfig {
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    #[must_use]
    pub fn pong_window(&self) -> Duration {
        Duration::from_millis(self.pong_window_ms)
    }

    #[must_use]
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    #[must_use]
    pub fn first_contact(&self) -> Duration {
        Duration::from_millis(self.first_contact_ms)
    }

    #[must_use]
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Endpoint penalty accrual settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Seconds without a new failure after which a penalty record resets to
    /// zero and the tripped flag clears. Defaults to `60`.
    #[serde(default = "default_decay_seconds")]
    pub decay_seconds: u64,

    /// Penalty count strictly above this value trips the endpoint unhealthy
    /// and migrates bound clients. Defaults to `1`.
    #[serde(default = "default_trip_threshold")]
    pub trip_threshold: u32,
}

fn default_decay_seconds() -> u64 {
    60
}

fn default_trip_threshold() -> u32 {
    1
}

impl PenaltyConfig {
    #[must_use]
    pub fn decay(&self) -> Duration {
        Duration::from_secs(self.decay_seconds)
    }
}

/// Transaction policy knobs enforced by the filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Declared fee strictly above this many drops is rejected. Defaults to
    /// `2_000_000`.
    #[serde(default = "default_fee_cap_drops")]
    pub fee_cap_drops: u64,

    /// Higher cap applied to the irreversible account-deletion type.
    /// Defaults to `10_000_000`.
    #[serde(default = "default_account_delete_fee_cap_drops")]
    pub account_delete_fee_cap_drops: u64,

    /// Transaction types rejected unconditionally, regardless of fee.
    #[serde(default = "default_disabled_tx_types")]
    pub disabled_tx_types: Vec<String>,

    /// Ceiling silently applied to oversized result-count `limit` fields.
    /// Defaults to `400`.
    #[serde(default = "default_limit_ceiling")]
    pub limit_ceiling: u64,

    /// Neutral account substituted into self-referential trust-line queries.
    #[serde(default = "default_neutral_account")]
    pub neutral_account: String,
}

fn default_fee_cap_drops() -> u64 {
    2_000_000
}

fn default_account_delete_fee_cap_drops() -> u64 {
    10_000_000
}

fn default_disabled_tx_types() -> Vec<String> {
    vec!["CheckCreate".to_string(), "CheckCash".to_string(), "CheckCancel".to_string()]
}

fn default_limit_ceiling() -> u64 {
    400
}

fn default_neutral_account() -> String {
    // ACCOUNT_ONE: a well-known address nobody holds keys for.
    "rrrrrrrrrrrrrrrrrrrrBZbvji".to_string()
}

/// External advisory feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryConfig {
    /// Address-reputation feed URL; `None` disables the blacklist check.
    #[serde(default)]
    pub reputation_url: Option<String>,

    /// Destination-tag-required feed URL; `None` disables the tag check.
    #[serde(default)]
    pub destination_tag_url: Option<String>,

    /// Refresh interval for both feeds, in seconds. Defaults to `300`.
    #[serde(default = "default_refresh_seconds")]
    pub refresh_seconds: u64,
}

fn default_refresh_seconds() -> u64 {
    300
}

impl AdvisoryConfig {
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds)
    }
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g. "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub format: String,
}

/// Root application configuration containing all subsystem settings.
///
/// # Example
///
/// ```toml
/// [server]
/// bind_port = 4001
///
/// [[uplinks]]
/// role = "basic"
/// url = "wss://node-a.example.net"
///
/// [[uplinks]]
/// role = "submit"
/// url = "wss://submit.example.net"
///
/// [limits]
/// ip_basic = 8
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream endpoints per role. Cannot be empty.
    #[serde(default)]
    pub uplinks: Vec<UplinkEntry>,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub penalty: PenaltyConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub advisory: AdvisoryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), bind_port: 4001, admin_port: 4002 }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ip_basic: default_ip_basic(),
            ip_whitelist: Vec::new(),
            message_buffer: default_message_buffer(),
            command_history: default_command_history(),
            control_frame_bytes: default_control_frame_bytes(),
            subscription_register_bytes: default_subscription_register_bytes(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_window_ms: default_pong_window_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            first_contact_ms: default_first_contact_ms(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self { decay_seconds: default_decay_seconds(), trip_threshold: default_trip_threshold() }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            fee_cap_drops: default_fee_cap_drops(),
            account_delete_fee_cap_drops: default_account_delete_fee_cap_drops(),
            disabled_tx_types: default_disabled_tx_types(),
            limit_ceiling: default_limit_ceiling(),
            neutral_account: default_neutral_account(),
        }
    }
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            reputation_url: None,
            destination_tag_url: None,
            refresh_seconds: default_refresh_seconds(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            uplinks: Vec::new(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            penalty: PenaltyConfig::default(),
            policy: PolicyConfig::default(),
            advisory: AdvisoryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `TETHER__` prefix can override any
    /// configuration value. Use `__` as a separator for nested fields
    /// (e.g. `TETHER__SERVER__BIND_PORT=8080`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("TETHER").separator("__"))
            .build()?;

        let config: Self = config_builder.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `config/config.toml` with fallback to defaults.
    ///
    /// The config file path can be overridden using the `TETHER_CONFIG`
    /// environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("TETHER_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Checks cross-field consistency the serde layer cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Message`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.uplinks {
            if !entry.url.starts_with("ws://") && !entry.url.starts_with("wss://") {
                return Err(ConfigError::Message(format!(
                    "uplink url must be ws:// or wss://: {}",
                    entry.url
                )));
            }
        }
        let mut seen = HashSet::new();
        for entry in &self.uplinks {
            if !seen.insert(entry.url.as_str()) {
                return Err(ConfigError::Message(format!("duplicate uplink url: {}", entry.url)));
            }
        }
        if self.limits.message_buffer == 0 {
            return Err(ConfigError::Message("limits.message_buffer must be > 0".to_string()));
        }
        if self.limits.command_history == 0 {
            return Err(ConfigError::Message("limits.command_history must be > 0".to_string()));
        }
        if self.timeouts.pong_window_ms <= self.timeouts.ping_interval_ms {
            return Err(ConfigError::Message(
                "timeouts.pong_window_ms must exceed timeouts.ping_interval_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed socket address of the WebSocket listener.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.bind_port).parse().map_err(|_| {
            format!("Invalid socket address: {}:{}", self.server.bind_address, self.server.bind_port)
        })
    }

    /// Parsed socket address of the admin listener.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed.
    pub fn admin_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.admin_port).parse().map_err(|_| {
            format!(
                "Invalid admin address: {}:{}",
                self.server.bind_address, self.server.admin_port
            )
        })
    }
}
