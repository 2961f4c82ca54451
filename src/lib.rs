pub mod anomaly_detection;
pub mod attack_sim;
pub mod can_bus;
pub mod config;
pub mod error;
pub mod monitor;
pub mod network;
pub mod rate_limiter;
pub mod safety;
pub mod security_log;
pub mod types;

pub use anomaly_detection::{Classification, DetectionEvent, Detector, DetectorConfig};
pub use attack_sim::orchestrator::{
    CapabilityRegistry, Scenario, ScenarioLibrary, ScenarioOrchestrator, ScenarioOutcome,
    ScenarioReport, ScenarioSource, StaticCapabilities,
};
pub use attack_sim::{
    AttackConfig, AttackEngine, AttackKind, AttackOutcome, AttackResult, AttackState,
    LateralPattern, ReplaySource, StopToken,
};
pub use can_bus::{BusTransport, FrameReceiver, VirtualCanBus};
pub use config::HydraConfig;
pub use error::{ConfigError, ScenarioError, TransportError};
pub use monitor::{Monitor, MonitorConfig, MonitorHandle, MonitorStats};
pub use network::{BusClient, BusReader, BusWriter, NetMessage, TcpBus};
pub use rate_limiter::RateLimiter;
pub use safety::{SafetyLimits, SafetyValidator, ValidationVerdict, VerdictReason};
pub use security_log::{BackgroundLogSink, JsonlLogSink, LogEvent, LogSink, MemoryLogSink};
pub use types::{CanFrame, CanId};
