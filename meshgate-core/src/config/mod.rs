//! Configuration management for meshgate
//!
//! Defaults match the timings the protocols were tuned with; every value can be
//! overridden from a TOML file or from `MESHGATE_<SECTION>_<KEY>` environment
//! variables. `validate()` runs before any protocol starts, so a bad value is a
//! startup failure rather than a misbehaving loop.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Default pubsub topic for heartbeats and chat
pub const DEFAULT_PRESENCE_TOPIC: &str = "mesh-presence-v1";

/// Default pubsub topic for the access handshake
pub const DEFAULT_NEGOTIATION_TOPIC: &str = "storage-negotiation-v1";

/// Heartbeats may be lost; an offline timeout shorter than this many
/// heartbeat intervals flaps peers on ordinary jitter.
pub const MIN_HEARTBEATS_PER_TIMEOUT: u32 = 3;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub presence: PresenceConfig,
    pub registry: RegistryConfig,
    pub negotiation: NegotiationConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Where the shared registry write credential comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CredentialSource {
    /// Base64 ed25519 seed given inline (usually via `MESHGATE_REGISTRY_SECRET`)
    Seed { secret: String },
    /// Base64 ed25519 seed read from a file
    File { path: PathBuf },
    /// Freshly generated key held only in memory; peers will not share a registry
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name shown to other peers and written into the registry
    pub display_name: String,

    pub credential: CredentialSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub topic: String,

    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,

    /// A peer silent for longer than this is dropped from the online list
    #[serde(with = "humantime_serde")]
    pub offline_timeout: Duration,

    /// Address advertised in heartbeats so peers can dial us directly
    pub reach_address: Option<String>,
}

/// How registry entries are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicyKind {
    /// Names only; presence of a name is membership
    Simple,
    /// Names carry `lastSeen`; fresher wins and stale entries are collected
    Timestamped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub resolve_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,

    /// Minimum spacing between two publishes from this peer
    #[serde(with = "humantime_serde")]
    pub publish_cooldown: Duration,

    pub policy: MergePolicyKind,

    /// Timestamped policy only: entries older than this are dropped
    #[serde(with = "humantime_serde")]
    pub staleness_window: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Whether this peer must earn access before going online
    pub enabled: bool,

    pub topic: String,

    #[serde(with = "humantime_serde")]
    pub mesh_poll_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub request_retry_interval: Duration,

    /// Responder pause before each reply so the mesh can form
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,

    pub assignment_batch: usize,

    pub library_size: usize,

    /// `None` keeps retrying REQUEST_WORK forever
    pub max_request_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            display_name: "peer".to_string(),
            credential: CredentialSource::InMemory,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_PRESENCE_TOPIC.to_string(),
            heartbeat_interval: Duration::from_secs(1),
            prune_interval: Duration::from_secs(2),
            offline_timeout: Duration::from_secs(5),
            reach_address: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(15),
            resolve_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(20),
            publish_cooldown: Duration::from_secs(60),
            policy: MergePolicyKind::Simple,
            staleness_window: Duration::from_secs(15 * 60),
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: DEFAULT_NEGOTIATION_TOPIC.to_string(),
            mesh_poll_interval: Duration::from_secs(1),
            request_retry_interval: Duration::from_secs(2),
            settle_delay: Duration::from_millis(500),
            assignment_batch: 5,
            library_size: 100,
            max_request_attempts: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn parse_duration(var: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", var, e)))
}

fn parse_flag(var: &str, raw: &str) -> Result<bool, ConfigError> {
    raw.parse()
        .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", var, e)))
}

impl Config {
    /// Defaults overlaid with environment variables
    ///
    /// Environment variables follow the pattern `MESHGATE_<SECTION>_<KEY>`,
    /// e.g. `MESHGATE_PRESENCE_HEARTBEAT_INTERVAL=2s`. The shared registry
    /// secret is read from `MESHGATE_REGISTRY_SECRET` (inline base64 seed) or
    /// `MESHGATE_REGISTRY_SECRET_FILE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables onto an existing configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| env::var(name).ok())
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("MESHGATE_IDENTITY_DISPLAY_NAME") {
            self.identity.display_name = name;
        }
        if let Some(path) = lookup("MESHGATE_REGISTRY_SECRET_FILE") {
            self.identity.credential = CredentialSource::File { path: PathBuf::from(path) };
        }
        if let Some(secret) = lookup("MESHGATE_REGISTRY_SECRET") {
            self.identity.credential = CredentialSource::Seed { secret };
        }

        if let Some(topic) = lookup("MESHGATE_PRESENCE_TOPIC") {
            self.presence.topic = topic;
        }
        if let Some(raw) = lookup("MESHGATE_PRESENCE_HEARTBEAT_INTERVAL") {
            self.presence.heartbeat_interval =
                parse_duration("MESHGATE_PRESENCE_HEARTBEAT_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("MESHGATE_PRESENCE_OFFLINE_TIMEOUT") {
            self.presence.offline_timeout =
                parse_duration("MESHGATE_PRESENCE_OFFLINE_TIMEOUT", &raw)?;
        }
        if let Some(addr) = lookup("MESHGATE_PRESENCE_REACH_ADDRESS") {
            self.presence.reach_address = Some(addr);
        }

        if let Some(raw) = lookup("MESHGATE_REGISTRY_SYNC_INTERVAL") {
            self.registry.sync_interval = parse_duration("MESHGATE_REGISTRY_SYNC_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("MESHGATE_REGISTRY_PUBLISH_COOLDOWN") {
            self.registry.publish_cooldown =
                parse_duration("MESHGATE_REGISTRY_PUBLISH_COOLDOWN", &raw)?;
        }
        if let Some(raw) = lookup("MESHGATE_REGISTRY_POLICY") {
            self.registry.policy = match raw.to_ascii_lowercase().as_str() {
                "simple" => MergePolicyKind::Simple,
                "timestamped" => MergePolicyKind::Timestamped,
                other => {
                    return Err(ConfigError::InvalidValue(format!(
                        "MESHGATE_REGISTRY_POLICY: unknown policy '{}'",
                        other
                    )))
                }
            };
        }

        if let Some(raw) = lookup("MESHGATE_NEGOTIATION_ENABLED") {
            self.negotiation.enabled = parse_flag("MESHGATE_NEGOTIATION_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("MESHGATE_NEGOTIATION_MAX_REQUEST_ATTEMPTS") {
            let attempts = raw.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("MESHGATE_NEGOTIATION_MAX_REQUEST_ATTEMPTS: {}", e))
            })?;
            self.negotiation.max_request_attempts = Some(attempts);
        }

        if let Some(level) = lookup("MESHGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(raw) = lookup("MESHGATE_LOG_JSON") {
            self.logging.json_format = parse_flag("MESHGATE_LOG_JSON", &raw)?;
        }
        if let Some(raw) = lookup("MESHGATE_METRICS_ENABLED") {
            self.metrics.enabled = parse_flag("MESHGATE_METRICS_ENABLED", &raw)?;
        }

        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.display_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "display_name must not be empty".to_string(),
            ));
        }
        match &self.identity.credential {
            CredentialSource::Seed { secret } if secret.trim().is_empty() => {
                return Err(ConfigError::ValidationFailed(
                    "registry secret is empty".to_string(),
                ));
            }
            CredentialSource::File { path } if path.as_os_str().is_empty() => {
                return Err(ConfigError::ValidationFailed(
                    "registry secret file path is empty".to_string(),
                ));
            }
            _ => {}
        }

        let presence = &self.presence;
        if presence.topic.is_empty() {
            return Err(ConfigError::ValidationFailed("presence topic is empty".to_string()));
        }
        if presence.heartbeat_interval.is_zero() || presence.prune_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "presence intervals must be greater than 0".to_string(),
            ));
        }
        let min_timeout = presence
            .heartbeat_interval
            .checked_mul(MIN_HEARTBEATS_PER_TIMEOUT)
            .ok_or_else(|| {
                ConfigError::ValidationFailed(format!(
                    "heartbeat_interval ({:?}) is out of range",
                    presence.heartbeat_interval
                ))
            })?;
        if presence.offline_timeout < min_timeout {
            return Err(ConfigError::ValidationFailed(format!(
                "offline_timeout ({:?}) must be at least {}x heartbeat_interval ({:?})",
                presence.offline_timeout, MIN_HEARTBEATS_PER_TIMEOUT, presence.heartbeat_interval
            )));
        }

        let registry = &self.registry;
        if registry.sync_interval.is_zero()
            || registry.resolve_timeout.is_zero()
            || registry.publish_timeout.is_zero()
        {
            return Err(ConfigError::ValidationFailed(
                "registry interval and timeouts must be greater than 0".to_string(),
            ));
        }
        if registry.policy == MergePolicyKind::Timestamped {
            // a live peer refreshes its entry at least once per cooldown plus one tick
            let refresh = registry.publish_cooldown.checked_add(registry.sync_interval);
            if refresh.map_or(true, |refresh| registry.staleness_window < refresh) {
                return Err(ConfigError::ValidationFailed(format!(
                    "staleness_window ({:?}) must be at least publish_cooldown + sync_interval",
                    registry.staleness_window
                )));
            }
        }

        let negotiation = &self.negotiation;
        if negotiation.topic.is_empty() {
            return Err(ConfigError::ValidationFailed("negotiation topic is empty".to_string()));
        }
        if negotiation.mesh_poll_interval.is_zero() || negotiation.request_retry_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "negotiation intervals must be greater than 0".to_string(),
            ));
        }
        if negotiation.assignment_batch == 0 {
            return Err(ConfigError::ValidationFailed(
                "assignment_batch must be greater than 0".to_string(),
            ));
        }
        if negotiation.assignment_batch > negotiation.library_size {
            return Err(ConfigError::ValidationFailed(format!(
                "assignment_batch ({}) exceeds library_size ({})",
                negotiation.assignment_batch, negotiation.library_size
            )));
        }
        if negotiation.max_request_attempts == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_request_attempts must be greater than 0 when set".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}
