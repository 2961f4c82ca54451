/// Error types shared across the toolkit
///
/// Policy blocks (denylisted ID, rate limit) are deliberately absent: they are
/// recorded as verdicts and counted, never raised.
use std::path::PathBuf;
use thiserror::Error;

/// Static configuration failures. Raised before an attack enters `Running`
/// and never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{kind} attack has an empty target list")]
    EmptyTargets { kind: &'static str },

    #[error("attack duration must be greater than zero")]
    ZeroDuration,

    #[error("{kind} attack requires a non-zero interval")]
    ZeroInterval { kind: &'static str },

    #[error("payload of {len} bytes exceeds the 8-byte CAN limit")]
    PayloadTooLong { len: usize },

    #[error("fuzz payload length range {min}..={max} is invalid (must lie within 0..=8)")]
    InvalidFuzzLength { min: usize, max: usize },

    #[error("CAN ID 0x{id:X} is outside the 29-bit identifier space")]
    InvalidCanId { id: u32 },

    #[error("replay speed {speed} must be a finite value greater than zero")]
    InvalidSpeed { speed: f64 },

    #[error("lateral base dwell must be greater than zero")]
    ZeroDwell,

    #[error("duration {requested_secs}s exceeds the maximum of {max_secs}s")]
    DurationExceedsLimit { requested_secs: u64, max_secs: u64 },

    #[error("message rate {rate:.1} msg/s exceeds the maximum of {max} msg/s")]
    RateExceedsLimit { rate: f64, max: u32 },

    #[error("too many concurrent attacks ({active}/{max})")]
    TooManyConcurrentAttacks { active: usize, max: usize },

    #[error("replay log {path}: {reason}")]
    ReplayLog { path: PathBuf, reason: String },

    #[error("replay source contains no frames")]
    EmptyReplayLog,

    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Failures of the bus capability itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel '{channel}' is closed")]
    Closed { channel: String },

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("frame codec error: {0}")]
    Codec(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

/// Scenario-level failures surfaced before any frame is sent
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScenarioError {
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),

    #[error("scenario step {step} ({attack}) is invalid: {source}")]
    Config {
        step: usize,
        attack: String,
        #[source]
        source: ConfigError,
    },

    #[error("scenario '{scenario}' is missing prerequisites: {}", missing.join(", "))]
    PrerequisiteMissing {
        scenario: String,
        missing: Vec<String>,
    },
}
