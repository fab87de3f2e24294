//! Configuration types for the Neptun bridge
//!
//! This module provides the configuration structures for topic layout,
//! static command destinations, liveness checks, command retries, the
//! bridge event loop and transport reconnection. Every section has serde
//! defaults, so an empty JSON object is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{NeptunError, Result};

/// Default prefix for topics published by the bridge
pub const DEFAULT_TOPIC_PREFIX: &str = "neptun";

/// Shortest allowed liveness check period
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of send attempts per command
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default spacing between command attempts
pub const DEFAULT_RETRY_SPACING: Duration = Duration::from_secs(2);

/// Default outbound queue size
pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// Main configuration for the Neptun bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeptunConfig {
    /// Topic layout
    #[serde(default)]
    pub topics: TopicConfig,

    /// Static outbound channel per device, keyed by device MAC
    #[serde(default)]
    pub destinations: HashMap<String, String>,

    /// Liveness watchdog settings
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Command retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Event loop settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl NeptunConfig {
    /// Load from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.topics.topic_prefix.is_empty() {
            return Err(NeptunError::MissingConfig("topics.topic_prefix".to_string()));
        }
        for prefix in std::iter::once(&self.topics.topic_prefix)
            .chain(self.topics.cloud_prefix.iter())
            .chain(self.destinations.values())
        {
            if prefix.contains(['+', '#', '/']) {
                return Err(NeptunError::InvalidConfig(format!(
                    "prefix '{}' must be a single topic segment",
                    prefix
                )));
            }
        }
        if self.bridge.outgoing_queue_size == 0 {
            return Err(NeptunError::InvalidConfig(
                "bridge.outgoing_queue_size must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(NeptunError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Topic layout on the local bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Prefix for rendered state and command topics
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Cloud prefix; when set, only `<cloud_prefix>/+/from` is consumed and
    /// every command is sent there
    #[serde(default)]
    pub cloud_prefix: Option<String>,

    /// Retain flag for settings and identity topics
    #[serde(default = "default_true")]
    pub retain: bool,

    /// Publish raw frame diagnostics under `raw/`
    #[serde(default)]
    pub publish_raw: bool,
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            cloud_prefix: None,
            retain: true,
            publish_raw: false,
        }
    }
}

/// Liveness watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Period between evaluations (floored at 5 s)
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: Duration,

    /// Silence allowed before a device counts as lost
    #[serde(with = "humantime_serde", default = "default_lost_timeout")]
    pub default_lost_timeout: Duration,

    /// Per-device overrides, clamped to 10 s..=3600 s
    #[serde(with = "humantime_serde_map", default)]
    pub device_timeouts: HashMap<String, Duration>,
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_lost_timeout() -> Duration {
    Duration::from_secs(300)
}

impl LivenessConfig {
    /// Check interval after applying the floor
    pub fn effective_interval(&self) -> Duration {
        self.check_interval.max(MIN_CHECK_INTERVAL)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            default_lost_timeout: default_lost_timeout(),
            device_timeouts: HashMap::new(),
        }
    }
}

/// Command retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Sends per command, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed spacing between attempts
    #[serde(with = "humantime_serde", default = "default_retry_spacing")]
    pub spacing: Duration,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_spacing() -> Duration {
    DEFAULT_RETRY_SPACING
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            spacing: DEFAULT_RETRY_SPACING,
        }
    }
}

/// Bridge event loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Queue size for messages produced outside the event loop
    #[serde(default = "default_queue_size")]
    pub outgoing_queue_size: usize,

    /// Skip a wired line's status when a wireless sensor with the same
    /// index reported in the same frame
    #[serde(default)]
    pub suppress_wired_on_wireless: bool,
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            outgoing_queue_size: DEFAULT_QUEUE_SIZE,
            suppress_wired_on_wireless: false,
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before the first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Cap for the doubling delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Maximum number of reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (0-based): doubles up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_attempts: 0,
        }
    }
}

/// Builder for NeptunConfig
#[derive(Debug, Default)]
pub struct NeptunConfigBuilder {
    config: NeptunConfig,
}

impl NeptunConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: NeptunConfig) -> Self {
        Self { config }
    }

    /// Set the local topic prefix
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.topics.topic_prefix = prefix.into();
        self
    }

    /// Set the cloud prefix; an empty string clears it
    pub fn cloud_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.config.topics.cloud_prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    /// Set the retain flag for settings topics
    pub fn retain(mut self, retain: bool) -> Self {
        self.config.topics.retain = retain;
        self
    }

    /// Enable or disable raw frame diagnostics
    pub fn publish_raw(mut self, enabled: bool) -> Self {
        self.config.topics.publish_raw = enabled;
        self
    }

    /// Route one device's commands to a fixed channel
    pub fn destination(mut self, device: impl Into<String>, channel: impl Into<String>) -> Self {
        self.config
            .destinations
            .insert(device.into(), channel.into());
        self
    }

    /// Set the liveness check period
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.config.liveness.check_interval = interval;
        self
    }

    /// Set the default lost timeout
    pub fn lost_timeout(mut self, timeout: Duration) -> Self {
        self.config.liveness.default_lost_timeout = timeout;
        self
    }

    /// Set one device's lost timeout
    pub fn device_lost_timeout(mut self, device: impl Into<String>, timeout: Duration) -> Self {
        self.config
            .liveness
            .device_timeouts
            .insert(device.into(), timeout);
        self
    }

    /// Set retry attempts and spacing
    pub fn retry(mut self, max_attempts: u32, spacing: Duration) -> Self {
        self.config.retry = RetryConfig {
            max_attempts,
            spacing,
        };
        self
    }

    /// Set the outbound queue size
    pub fn outgoing_queue_size(mut self, size: usize) -> Self {
        self.config.bridge.outgoing_queue_size = size;
        self
    }

    /// Enable the wired/wireless overlap rule
    pub fn suppress_wired_on_wireless(mut self, enabled: bool) -> Self {
        self.config.bridge.suppress_wired_on_wireless = enabled;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> NeptunConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// Same, for a map of durations
mod humantime_serde_map {
    use serde::ser::SerializeMap;
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn serialize<S>(map: &HashMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, duration) in map {
            out.serialize_entry(key, &humantime::format_duration(*duration).to_string())?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        HashMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, s)| {
                humantime::parse_duration(&s)
                    .map(|d| (key, d))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NeptunConfig::default();
        assert_eq!(config.topics.topic_prefix, "neptun");
        assert!(config.topics.retain);
        assert!(!config.topics.publish_raw);
        assert_eq!(config.liveness.check_interval, Duration::from_secs(30));
        assert_eq!(config.liveness.default_lost_timeout, Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.spacing, Duration::from_secs(2));
        assert_eq!(config.bridge.outgoing_queue_size, 256);
        assert!(!config.bridge.suppress_wired_on_wireless);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = NeptunConfigBuilder::new()
            .topic_prefix("home")
            .cloud_prefix("cloud")
            .retain(false)
            .destination("AA:BB", "other")
            .retry(5, Duration::from_secs(1))
            .build();

        assert_eq!(config.topics.topic_prefix, "home");
        assert_eq!(config.topics.cloud_prefix.as_deref(), Some("cloud"));
        assert!(!config.topics.retain);
        assert_eq!(config.destinations["AA:BB"], "other");
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_empty_cloud_prefix_clears() {
        let config = NeptunConfigBuilder::new().cloud_prefix("").build();
        assert_eq!(config.topics.cloud_prefix, None);
    }

    #[test]
    fn test_from_json_with_humantime() {
        let config = NeptunConfig::from_json(
            r#"{
                "topics": { "cloud_prefix": "xyz" },
                "liveness": {
                    "check_interval": "10s",
                    "device_timeouts": { "AA:BB": "2m" }
                },
                "retry": { "spacing": "500ms" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.topics.topic_prefix, "neptun");
        assert_eq!(config.topics.cloud_prefix.as_deref(), Some("xyz"));
        assert_eq!(config.liveness.check_interval, Duration::from_secs(10));
        assert_eq!(
            config.liveness.device_timeouts["AA:BB"],
            Duration::from_secs(120)
        );
        assert_eq!(config.retry.spacing, Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_serialize_roundtrip_keeps_durations() {
        let config = NeptunConfigBuilder::new()
            .device_lost_timeout("AA:BB", Duration::from_secs(90))
            .build();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = NeptunConfig::from_json(&json).unwrap();
        assert_eq!(
            parsed.liveness.device_timeouts["AA:BB"],
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_validate_rejects_zero_queue_and_attempts() {
        let config = NeptunConfigBuilder::new().outgoing_queue_size(0).build();
        assert!(matches!(
            config.validate(),
            Err(NeptunError::InvalidConfig(_))
        ));

        let config = NeptunConfigBuilder::new()
            .retry(0, Duration::from_secs(2))
            .build();
        assert!(matches!(
            config.validate(),
            Err(NeptunError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_wildcard_prefix() {
        let config = NeptunConfigBuilder::new().cloud_prefix("+").build();
        assert!(config.validate().is_err());
        let config = NeptunConfigBuilder::new().topic_prefix("").build();
        assert!(matches!(
            config.validate(),
            Err(NeptunError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_check_interval_floor() {
        let config = NeptunConfigBuilder::new()
            .check_interval(Duration::from_secs(1))
            .build();
        assert_eq!(config.liveness.effective_interval(), MIN_CHECK_INTERVAL);
    }

    #[test]
    fn test_reconnect_backoff_doubles_to_cap() {
        let reconnect = ReconnectConfig::default();
        let delays: Vec<u64> = (0..7).map(|n| reconnect.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(reconnect.delay_for(100), Duration::from_secs(30));
    }
}
