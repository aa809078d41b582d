//! Device configuration.
//!
//! Settings come from an optional TOML file, are overlaid with environment
//! variables and validated once before any network activity. The resulting
//! [`Configuration`] is read-only for the rest of the process lifetime.
//!
//! ## Lookup order
//!
//! 1. `$RELAYNODE_CONFIG` (must exist when set)
//! 2. `/etc/relaynode/config.toml`
//! 3. `<config dir>/relaynode/config.toml`
//!
//! A missing file means all defaults. Templates containing `{uid}` are
//! expanded later against the [`DeviceIdentity`](crate::identity::DeviceIdentity).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "RELAYNODE_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/relaynode/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What the supervisor does when a link or session fault escapes a cycle.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPolicy {
    /// Propagate the fault and let the watchdog or process manager restart us.
    #[default]
    FailFast,
    /// Log the fault and start over from the network link.
    SelfHealing,
}

impl FromStr for RetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" => Ok(Self::FailFast),
            "self-healing" | "selfhealing" => Ok(Self::SelfHealing),
            other => Err(format!(
                "unknown retry policy '{}', expected 'fail-fast' or 'self-healing'",
                other
            )),
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail-fast"),
            Self::SelfHealing => write!(f, "self-healing"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogBackend {
    /// Kernel watchdog device, see [`WatchdogConfig::device`].
    #[default]
    Hardware,
    /// In-process monitor thread that aborts on expiry.
    Software,
}

impl FromStr for WatchdogBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hardware" => Ok(Self::Hardware),
            "software" => Ok(Self::Software),
            other => Err(format!(
                "unknown watchdog backend '{}', expected 'hardware' or 'software'",
                other
            )),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Wireless network to join. Without one the link only waits for a route.
    pub ssid: Option<String>,
    pub password: Option<String>,
    /// Hostname template, `{uid}` is replaced by the device identity.
    pub hostname: String,
    pub interface: String,
    pub wait_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: None,
            password: None,
            hostname: "relay-{uid}".to_string(),
            interface: "wlan0".to_string(),
            wait_secs: 30,
        }
    }
}

impl NetworkConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Command topic. Required.
    pub topic: Option<String>,
    /// Status topic template. An empty string disables status publishing.
    pub debug_topic: Option<String>,
    pub keep_alive_secs: u64,
    /// Upper bound for a single service call; also the guard feeding period.
    pub socket_timeout_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "mqtt".to_string(),
            port: 1883,
            tls: false,
            username: None,
            password: None,
            topic: None,
            debug_topic: Some("debug/relay-{uid}".to_string()),
            keep_alive_secs: 60,
            socket_timeout_ms: 100,
            connect_timeout_secs: 10,
        }
    }
}

impl MqttConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Debug topic template, `None` when disabled.
    pub fn debug_topic_template(&self) -> Option<&str> {
        self.debug_topic
            .as_deref()
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// BCM pin number driving the relay.
    pub pin: u8,
    pub active_low: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pin: 17,
            active_low: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub timeout_secs: u64,
    pub backend: WatchdogBackend,
    pub device: PathBuf,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 180,
            backend: WatchdogBackend::Hardware,
            device: PathBuf::from("/dev/watchdog"),
        }
    }
}

impl WatchdogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub retry_policy: RetryPolicy,
    pub retry_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::FailFast,
            retry_delay_ms: 1000,
        }
    }
}

impl SupervisorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Configuration {
    pub network: NetworkConfig,
    pub mqtt: MqttConfig,
    pub relay: RelayConfig,
    pub watchdog: WatchdogConfig,
    pub supervisor: SupervisorConfig,
}

impl Configuration {
    /// Loads, overlays and validates the configuration from the process
    /// environment.
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = |var: &str| std::env::var(var).ok();

        let mut config = match resolve_path(&lookup) {
            Some(path) => Self::from_file(&path)?,
            None => {
                info!("No config file found, using defaults and environment");
                Self::default()
            }
        };
        config.apply_env(lookup)?;
        config.validate()?;

        info!(
            "Configuration loaded: broker {}:{} (tls: {}), policy {}",
            config.mqtt.host, config.mqtt.port, config.mqtt.tls, config.supervisor.retry_policy
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading config file {:?}", path);
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides file values with the named environment variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("WIFI_SSID") {
            self.network.ssid = Some(value);
        }
        if let Some(value) = lookup("WIFI_PASSWORD") {
            self.network.password = Some(value);
        }
        if let Some(value) = lookup("WIFI_HOSTNAME") {
            self.network.hostname = value;
        }
        if let Some(value) = lookup("WIFI_INTERFACE") {
            self.network.interface = value;
        }

        if let Some(value) = lookup("MQTT_HOST") {
            self.mqtt.host = value;
        }
        if let Some(value) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_env("MQTT_PORT", &value)?;
        }
        if let Some(value) = lookup("MQTT_TLS") {
            self.mqtt.tls = parse_flag(&value);
        }
        if let Some(value) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(value);
        }
        if let Some(value) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(value);
        }
        if let Some(value) = lookup("MQTT_TOPIC") {
            self.mqtt.topic = Some(value);
        }
        if let Some(value) = lookup("MQTT_DEBUG_TOPIC") {
            self.mqtt.debug_topic = Some(value);
        }
        if let Some(value) = lookup("MQTT_SOCKET_TIMEOUT_MS") {
            self.mqtt.socket_timeout_ms = parse_env("MQTT_SOCKET_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = lookup("RELAY_PIN") {
            self.relay.pin = parse_env("RELAY_PIN", &value)?;
        }
        if let Some(value) = lookup("RELAY_ACTIVE_LOW") {
            self.relay.active_low = parse_flag(&value);
        }

        if let Some(value) = lookup("WATCHDOG_TIMEOUT") {
            self.watchdog.timeout_secs = parse_env("WATCHDOG_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("WATCHDOG_BACKEND") {
            self.watchdog.backend = parse_env("WATCHDOG_BACKEND", &value)?;
        }
        if let Some(value) = lookup("WATCHDOG_DEVICE") {
            self.watchdog.device = PathBuf::from(value);
        }

        if let Some(value) = lookup("RETRY_POLICY") {
            self.supervisor.retry_policy = parse_env("RETRY_POLICY", &value)?;
        }

        Ok(())
    }

    /// Checks required values and the timing relations the supervisor relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mqtt.topic.as_deref().map(str::trim) {
            Some(topic) if !topic.is_empty() => {}
            _ => return Err(ConfigError::Missing("mqtt.topic")),
        }

        if self.network.ssid.is_none() && self.network.password.is_some() {
            return Err(ConfigError::Invalid(
                "network.password is set but network.ssid is not".to_string(),
            ));
        }

        let watchdog = self.watchdog.timeout();
        if watchdog.is_zero() {
            return Err(ConfigError::Invalid(
                "watchdog.timeout_secs must be greater than zero".to_string(),
            ));
        }

        let socket = self.mqtt.socket_timeout();
        if socket.is_zero() {
            return Err(ConfigError::Invalid(
                "mqtt.socket_timeout_ms must be greater than zero".to_string(),
            ));
        }
        // The guard is fed once per service call.
        if socket * 2 >= watchdog {
            return Err(ConfigError::Invalid(format!(
                "mqtt.socket_timeout_ms ({:?}) must stay below half the watchdog timeout ({:?})",
                socket, watchdog
            )));
        }

        let connect = self.mqtt.connect_timeout();
        if connect.is_zero() || connect >= watchdog {
            return Err(ConfigError::Invalid(format!(
                "mqtt.connect_timeout_secs ({:?}) must be between zero and the watchdog timeout ({:?})",
                connect, watchdog
            )));
        }

        if self.network.wait() >= watchdog {
            return Err(ConfigError::Invalid(format!(
                "network.wait_secs ({:?}) must stay below the watchdog timeout ({:?})",
                self.network.wait(),
                watchdog
            )));
        }

        if self.supervisor.retry_delay() >= watchdog {
            return Err(ConfigError::Invalid(format!(
                "supervisor.retry_delay_ms ({:?}) must stay below the watchdog timeout ({:?})",
                self.supervisor.retry_delay(),
                watchdog
            )));
        }

        Ok(())
    }
}

fn resolve_path<F>(lookup: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(explicit) = lookup(CONFIG_ENV) {
        return Some(PathBuf::from(explicit));
    }

    let system = PathBuf::from(SYSTEM_CONFIG_PATH);
    if system.exists() {
        return Some(system);
    }

    dirs::config_dir()
        .map(|dir| dir.join("relaynode").join("config.toml"))
        .filter(|path| path.exists())
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// `true` and `1` enable a flag, anything else disables it.
fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true")
}
