/// Toolkit Configuration
///
/// One JSON file configures the transport, the safety gate, the monitor and
/// where audit logs go. Every field has a default, so `{}` is a valid file.
use crate::attack_sim::orchestrator::{ScenarioLibrary, StaticCapabilities};
use crate::can_bus::{BusTransport, VirtualCanBus};
use crate::error::{ConfigError, TransportError};
use crate::monitor::MonitorConfig;
use crate::network::TcpBus;
use crate::rate_limiter::RateLimiter;
use crate::safety::SafetyLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default TCP relay address
pub const DEFAULT_BUS_ADDRESS: &str = "127.0.0.1:9000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process broadcast bus
    Virtual { channel: String, capacity: usize },
    /// `bus_server` relay
    Tcp { address: String, client_name: String },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Virtual {
            channel: "vcan0".to_string(),
            capacity: 1024,
        }
    }
}

impl TransportConfig {
    pub async fn connect(&self) -> Result<Arc<dyn BusTransport>, TransportError> {
        match self {
            TransportConfig::Virtual { channel, capacity } => {
                Ok(Arc::new(VirtualCanBus::new(channel.clone(), *capacity)))
            }
            TransportConfig::Tcp {
                address,
                client_name,
            } => Ok(Arc::new(TcpBus::connect(address, client_name).await?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Frames allowed per window across all senders
    pub max_rate: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_rate: 1000,
            window_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn build(&self) -> RateLimiter {
        RateLimiter::new(self.max_rate, Duration::from_millis(self.window_ms))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HydraConfig {
    pub transport: TransportConfig,
    pub safety: SafetyLimits,
    pub rate_limit: RateLimitConfig,
    pub monitor: MonitorConfig,

    /// Directory for hash-chained audit logs
    pub audit_log_dir: PathBuf,

    /// Slack added to a scenario's summed step durations
    pub budget_overhead_ms: u64,

    /// Prerequisites declared reachable on this setup
    pub capabilities: Vec<String>,

    /// Extra scenario files (JSON arrays) merged over the built-in set
    pub scenario_files: Vec<PathBuf>,
}

impl Default for HydraConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            safety: SafetyLimits::default(),
            rate_limit: RateLimitConfig::default(),
            monitor: MonitorConfig::default(),
            audit_log_dir: PathBuf::from("attack_logs"),
            budget_overhead_ms: 1000,
            capabilities: Vec::new(),
            scenario_files: Vec::new(),
        }
    }
}

impl HydraConfig {
    /// Read and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: HydraConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.transport {
            TransportConfig::Virtual { channel, capacity } => {
                if channel.is_empty() {
                    return Err(invalid("transport.channel", "must not be empty"));
                }
                if *capacity == 0 {
                    return Err(invalid("transport.capacity", "must be greater than zero"));
                }
            }
            TransportConfig::Tcp { address, .. } => {
                if address.is_empty() {
                    return Err(invalid("transport.address", "must not be empty"));
                }
            }
        }

        if self.rate_limit.window_ms == 0 {
            return Err(invalid("rate_limit.window_ms", "must be greater than zero"));
        }
        if self.safety.max_concurrent_attacks == 0 {
            return Err(invalid(
                "safety.max_concurrent_attacks",
                "must be greater than zero",
            ));
        }
        for id in &self.safety.denied_ids {
            crate::types::CanId::from_raw(*id)?;
        }
        if self.monitor.queue_capacity == 0 {
            return Err(invalid("monitor.queue_capacity", "must be greater than zero"));
        }
        self.monitor.detector.validate()
    }

    pub fn budget_overhead(&self) -> Duration {
        Duration::from_millis(self.budget_overhead_ms)
    }

    pub fn capability_registry(&self) -> StaticCapabilities {
        StaticCapabilities::new(self.capabilities.iter().cloned())
    }

    /// Built-in scenarios plus everything in `scenario_files`
    pub fn scenario_library(&self) -> Result<ScenarioLibrary, ConfigError> {
        let mut library = ScenarioLibrary::builtin();
        for path in &self.scenario_files {
            let added = library.load_json_file(path)?;
            tracing::debug!(path = %path.display(), added, "scenario file loaded");
        }
        Ok(library)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}
