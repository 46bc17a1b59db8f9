use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per channel type (keyed by the decimal type id) model lists.
pub type DefaultChannelModels = BTreeMap<String, Vec<String>>;
/// Per channel type (keyed by the decimal type id) model remap tables.
pub type DefaultChannelModelMapping = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid value for option {key}: {value}")]
    InvalidOption { key: String, value: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub limits: LimitsConfig,
    pub index: IndexConfig,
    pub cache: EntityCacheConfig,
    pub health: HealthConfig,
    pub probe: ProbeConfig,
    pub relay: RelayConfig,
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.health.success_rate_threshold) {
            return Err(ConfigError::Invalid(format!(
                "health.success_rate_threshold must be within [0, 1], got {}",
                self.health.success_rate_threshold
            )));
        }
        if self.health.enable_metric && self.health.queue_size == 0 {
            return Err(ConfigError::Invalid(
                "health.queue_size must be > 0 when metrics are enabled".to_string(),
            ));
        }
        if self.index.sync_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "index.sync_interval_seconds must be > 0".to_string(),
            ));
        }
        if self.probe.enabled && self.probe.interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "probe.interval_seconds must be > 0 when probing is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Requests per minute per client IP; 0 disables the cap.
    pub global_api_rate_limit: u64,
    /// QPM applied to groups whose own qpm is 0.
    pub default_group_qpm: u64,
    /// Idle in-memory limiter windows older than this are evicted.
    pub key_expiration_seconds: u64,
    pub gc_interval_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global_api_rate_limit: 0,
            default_group_qpm: default_group_qpm(),
            key_expiration_seconds: default_key_expiration_seconds(),
            gc_interval_seconds: default_gc_interval_seconds(),
        }
    }
}

fn default_group_qpm() -> u64 {
    120
}

fn default_key_expiration_seconds() -> u64 {
    20 * 60
}

fn default_gc_interval_seconds() -> u64 {
    60
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub sync_interval_seconds: u64,
    pub default_channel_models: DefaultChannelModels,
    pub default_channel_model_mapping: DefaultChannelModelMapping,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            sync_interval_seconds: default_sync_interval_seconds(),
            default_channel_models: BTreeMap::new(),
            default_channel_model_mapping: BTreeMap::new(),
        }
    }
}

fn default_sync_interval_seconds() -> u64 {
    60
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityCacheConfig {
    pub ttl_seconds: u64,
    pub timeout_ms: u64,
}

impl Default for EntityCacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 60,
            timeout_ms: 500,
        }
    }
}

impl EntityCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enable_metric: bool,
    pub queue_size: usize,
    pub success_rate_threshold: f64,
    pub success_chan_size: usize,
    pub fail_chan_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enable_metric: false,
            queue_size: 10,
            success_rate_threshold: 0.8,
            success_chan_size: 1024,
            fail_chan_size: 128,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Probe latency above this disables an enabled channel.
    pub disable_threshold_seconds: f64,
    pub automatic_disable: bool,
    pub automatic_enable_on_success: bool,
    pub timeout_seconds: u64,
    /// Pause between two channel probes within one pass.
    pub pause_ms: u64,
    pub model: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 600,
            disable_threshold_seconds: 5.0,
            automatic_disable: false,
            automatic_enable_on_success: false,
            timeout_seconds: 30,
            pause_ms: 1_000,
            model: "gpt-3.5-turbo".to_string(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub retry_times: u64,
    pub store_timeout_ms: u64,
    /// Deadline for one upstream attempt. Expiry counts as a retryable
    /// failure.
    pub upstream_timeout_ms: u64,
    /// Deduct the estimate from the group balance up front and settle the
    /// difference afterwards.
    pub pre_consume: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_times: 0,
            store_timeout_ms: 5_000,
            upstream_timeout_ms: 300_000,
            pre_consume: false,
        }
    }
}

impl RelayConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms.max(1))
    }
}

pub const OPTION_AUTOMATIC_DISABLE_CHANNEL: &str = "AutomaticDisableChannelEnabled";
pub const OPTION_AUTOMATIC_ENABLE_CHANNEL: &str = "AutomaticEnableChannelEnabled";
pub const OPTION_CHANNEL_DISABLE_THRESHOLD: &str = "ChannelDisableThreshold";
pub const OPTION_RETRY_TIMES: &str = "RetryTimes";
pub const OPTION_GLOBAL_API_RATE_LIMIT: &str = "GlobalApiRateLimitNum";
pub const OPTION_DEFAULT_GROUP_QPM: &str = "DefaultGroupQPM";
pub const OPTION_DEFAULT_CHANNEL_MODELS: &str = "DefaultChannelModels";
pub const OPTION_DEFAULT_CHANNEL_MODEL_MAPPING: &str = "DefaultChannelModelMapping";

pub const OPTION_KEYS: &[&str] = &[
    OPTION_AUTOMATIC_DISABLE_CHANNEL,
    OPTION_AUTOMATIC_ENABLE_CHANNEL,
    OPTION_CHANNEL_DISABLE_THRESHOLD,
    OPTION_RETRY_TIMES,
    OPTION_GLOBAL_API_RATE_LIMIT,
    OPTION_DEFAULT_GROUP_QPM,
    OPTION_DEFAULT_CHANNEL_MODELS,
    OPTION_DEFAULT_CHANNEL_MODEL_MAPPING,
];

/// Runtime-mutable system options.
///
/// Scalars are atomics so the request path never takes a lock; the model maps
/// are swapped whole behind an `Arc`.
#[derive(Debug)]
pub struct RuntimeOptions {
    automatic_disable_channel: AtomicBool,
    automatic_enable_channel: AtomicBool,
    channel_disable_threshold_ms: AtomicU64,
    retry_times: AtomicU64,
    global_api_rate_limit: AtomicU64,
    default_group_qpm: AtomicU64,
    default_channel_models: RwLock<Arc<DefaultChannelModels>>,
    default_channel_model_mapping: RwLock<Arc<DefaultChannelModelMapping>>,
}

impl RuntimeOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            automatic_disable_channel: AtomicBool::new(config.probe.automatic_disable),
            automatic_enable_channel: AtomicBool::new(config.probe.automatic_enable_on_success),
            channel_disable_threshold_ms: AtomicU64::new(seconds_to_millis(
                config.probe.disable_threshold_seconds,
            )),
            retry_times: AtomicU64::new(config.relay.retry_times),
            global_api_rate_limit: AtomicU64::new(config.limits.global_api_rate_limit),
            default_group_qpm: AtomicU64::new(config.limits.default_group_qpm),
            default_channel_models: RwLock::new(Arc::new(
                config.index.default_channel_models.clone(),
            )),
            default_channel_model_mapping: RwLock::new(Arc::new(
                config.index.default_channel_model_mapping.clone(),
            )),
        }
    }

    pub fn automatic_disable_channel(&self) -> bool {
        self.automatic_disable_channel.load(Ordering::Relaxed)
    }

    pub fn automatic_enable_channel(&self) -> bool {
        self.automatic_enable_channel.load(Ordering::Relaxed)
    }

    pub fn channel_disable_threshold(&self) -> Duration {
        Duration::from_millis(self.channel_disable_threshold_ms.load(Ordering::Relaxed))
    }

    pub fn retry_times(&self) -> u64 {
        self.retry_times.load(Ordering::Relaxed)
    }

    pub fn global_api_rate_limit(&self) -> u64 {
        self.global_api_rate_limit.load(Ordering::Relaxed)
    }

    pub fn default_group_qpm(&self) -> u64 {
        self.default_group_qpm.load(Ordering::Relaxed)
    }

    pub fn default_channel_models(&self) -> Arc<DefaultChannelModels> {
        self.default_channel_models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn default_channel_model_mapping(&self) -> Arc<DefaultChannelModelMapping> {
        self.default_channel_model_mapping
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies one option by its persisted key. The value is validated before
    /// anything is stored.
    pub fn update(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidOption {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            OPTION_AUTOMATIC_DISABLE_CHANNEL => {
                let enabled = parse_bool(value).ok_or_else(invalid)?;
                self.automatic_disable_channel
                    .store(enabled, Ordering::Relaxed);
            }
            OPTION_AUTOMATIC_ENABLE_CHANNEL => {
                let enabled = parse_bool(value).ok_or_else(invalid)?;
                self.automatic_enable_channel
                    .store(enabled, Ordering::Relaxed);
            }
            OPTION_CHANNEL_DISABLE_THRESHOLD => {
                let seconds: f64 = value.trim().parse().map_err(|_| invalid())?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(invalid());
                }
                self.channel_disable_threshold_ms
                    .store(seconds_to_millis(seconds), Ordering::Relaxed);
            }
            OPTION_RETRY_TIMES => {
                let times: u64 = value.trim().parse().map_err(|_| invalid())?;
                self.retry_times.store(times, Ordering::Relaxed);
            }
            OPTION_GLOBAL_API_RATE_LIMIT => {
                let limit: u64 = value.trim().parse().map_err(|_| invalid())?;
                self.global_api_rate_limit.store(limit, Ordering::Relaxed);
            }
            OPTION_DEFAULT_GROUP_QPM => {
                let qpm: u64 = value.trim().parse().map_err(|_| invalid())?;
                self.default_group_qpm.store(qpm, Ordering::Relaxed);
            }
            OPTION_DEFAULT_CHANNEL_MODELS => {
                let models: DefaultChannelModels =
                    serde_json::from_str(value).map_err(|_| invalid())?;
                *self
                    .default_channel_models
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Arc::new(models);
            }
            OPTION_DEFAULT_CHANNEL_MODEL_MAPPING => {
                let mapping: DefaultChannelModelMapping =
                    serde_json::from_str(value).map_err(|_| invalid())?;
                *self
                    .default_channel_model_mapping
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Arc::new(mapping);
            }
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    /// Current values rendered the way they are persisted.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(
            OPTION_AUTOMATIC_DISABLE_CHANNEL.to_string(),
            self.automatic_disable_channel().to_string(),
        );
        out.insert(
            OPTION_AUTOMATIC_ENABLE_CHANNEL.to_string(),
            self.automatic_enable_channel().to_string(),
        );
        out.insert(
            OPTION_CHANNEL_DISABLE_THRESHOLD.to_string(),
            (self.channel_disable_threshold().as_secs_f64()).to_string(),
        );
        out.insert(
            OPTION_RETRY_TIMES.to_string(),
            self.retry_times().to_string(),
        );
        out.insert(
            OPTION_GLOBAL_API_RATE_LIMIT.to_string(),
            self.global_api_rate_limit().to_string(),
        );
        out.insert(
            OPTION_DEFAULT_GROUP_QPM.to_string(),
            self.default_group_qpm().to_string(),
        );
        out.insert(
            OPTION_DEFAULT_CHANNEL_MODELS.to_string(),
            serde_json::to_string(self.default_channel_models().as_ref())
                .unwrap_or_else(|_| "{}".to_string()),
        );
        out.insert(
            OPTION_DEFAULT_CHANNEL_MODEL_MAPPING.to_string(),
            serde_json::to_string(self.default_channel_model_mapping().as_ref())
                .unwrap_or_else(|_| "{}".to_string()),
        );
        out
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn seconds_to_millis(seconds: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    (seconds * 1000.0).round() as u64
}
