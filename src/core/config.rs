use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "spBv1.0";

/// Top-level configuration for the Sparkplug state core.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// What to do with a data message whose `seq` is not the expected successor.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SequencePolicy {
    /// Log the gap, adopt the received value and keep processing.
    LogOnly,
    /// Drop the message and leave the counter untouched.
    Reject,
    /// Drop the message and send the edge node a rebirth command.
    RejectAndRebirth,
}

impl FromStr for SequencePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log_only" | "log-only" => Ok(Self::LogOnly),
            "reject" => Ok(Self::Reject),
            "reject_and_rebirth" | "reject-and-rebirth" => Ok(Self::RejectAndRebirth),
            other => bail!("invalid sequence.policy {}", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceConfig {
    #[serde(default = "default_sequence_policy")]
    pub policy: SequencePolicy,
    /// Minimum gap between two rebirth requests to the same node.
    #[serde(default = "default_rebirth_cooldown_ms")]
    pub rebirth_cooldown_ms: u64,
}

impl SequenceConfig {
    pub fn rebirth_cooldown(&self) -> Duration {
        Duration::from_millis(self.rebirth_cooldown_ms)
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            policy: default_sequence_policy(),
            rebirth_cooldown_ms: default_rebirth_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Keep-alive multiplier after which a silent session counts as stale.
    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: f64,
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Silence allowed for a session with the given keep-alive before it is stale.
    pub fn stale_threshold(&self, keep_alive_secs: u16) -> Duration {
        Duration::try_from_secs_f64(f64::from(keep_alive_secs) * self.stale_multiplier)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sweep_interval_ms: default_sweep_interval_ms(),
            stale_multiplier: default_stale_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_messages")]
    pub max_messages: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_messages: default_queue_max_messages(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Directory for the filesystem store; `None` keeps checkpoints in memory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_node_ttl_secs")]
    pub node_ttl_secs: u64,
    #[serde(default = "default_node_ttl_secs")]
    pub device_ttl_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_birth_ttl_secs")]
    pub birth_ttl_secs: u64,
}

impl StoreConfig {
    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs(self.node_ttl_secs)
    }

    pub fn device_ttl(&self) -> Duration {
        Duration::from_secs(self.device_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn birth_ttl(&self) -> Duration {
        Duration::from_secs(self.birth_ttl_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            dir: None,
            node_ttl_secs: default_node_ttl_secs(),
            device_ttl_secs: default_node_ttl_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            birth_ttl_secs: default_birth_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            sequence: SequenceConfig::default(),
            monitor: MonitorConfig::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a path resolved via SPARKPLUG_CONFIG or defaults to `config/sparkplug.toml`.
    /// Applies SPARKPLUG_LOG_LEVEL and SPARKPLUG_SEQUENCE_POLICY after parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    /// Validate schema-level invariants before the core starts.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            bail!("namespace must be non-empty");
        }
        if self.monitor.sweep_interval_ms == 0 {
            bail!("monitor.sweep_interval_ms must be > 0");
        }
        if !(self.monitor.stale_multiplier.is_finite() && self.monitor.stale_multiplier > 0.0) {
            bail!("monitor.stale_multiplier must be a positive number");
        }
        if self.queue.max_messages == 0 {
            bail!("queue.max_messages must be > 0");
        }
        if let Some(dir) = &self.store.dir {
            if dir.exists() && !dir.is_dir() {
                bail!("store.dir {} is not a directory", dir.display());
            }
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("SPARKPLUG_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
        if let Ok(policy) = std::env::var("SPARKPLUG_SEQUENCE_POLICY") {
            self.sequence.policy = SequencePolicy::from_str(&policy)?;
        }
        Ok(())
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SPARKPLUG_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/sparkplug.toml")
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_sequence_policy() -> SequencePolicy {
    SequencePolicy::RejectAndRebirth
}

fn default_rebirth_cooldown_ms() -> u64 {
    5_000
}

fn default_enabled() -> bool {
    true
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

fn default_stale_multiplier() -> f64 {
    1.5
}

fn default_queue_max_messages() -> usize {
    10_000
}

fn default_node_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_session_ttl_secs() -> u64 {
    60 * 60
}

fn default_birth_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}
