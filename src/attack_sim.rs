/// Attack Simulation Framework
///
/// Declarative attack descriptions and the engine that turns them into timed,
/// rate-limited, safety-checked traffic on a shared bus.
///
/// Features:
/// - Injection, spoofing and flooding (fixed frames)
/// - Seeded fuzzing
/// - Replay of captured traffic with original timing
/// - Lateral movement across ECUs
/// - Scenario orchestration and metrics

pub mod engine;
pub mod fuzzing;
pub mod injection;
pub mod lateral;
pub mod metrics;
pub mod orchestrator;
pub mod replay;

use crate::error::ConfigError;
use crate::types::{CanId, MAX_PAYLOAD_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use engine::AttackEngine;
pub use lateral::LateralPattern;
pub use replay::{ReplayEntry, ReplayFormat, ReplaySource};

/// Kind-specific attack parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "attack", rename_all = "snake_case")]
pub enum AttackKind {
    /// Fixed frame at a fixed interval
    Injection {
        target_id: u32,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
        interval_ms: u64,
    },

    /// Single-byte value overriding what the legitimate ECU reports
    Spoof {
        target_id: u32,
        original_value: u8,
        spoof_value: u8,
        interval_ms: u64,
    },

    /// Re-emit captured frames with their original spacing, scaled by `speed`
    Replay {
        source: ReplaySource,
        #[serde(default = "default_speed")]
        speed: f64,
        /// Only replay these identifiers (empty = all)
        #[serde(default)]
        id_filter: Vec<u32>,
    },

    /// As fast as the rate limiter allows
    Flood {
        target_id: u32,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
    },

    /// Pseudo-random payloads from a seeded generator
    Fuzz {
        target_ids: Vec<u32>,
        seed: u64,
        interval_ms: u64,
        #[serde(default = "default_fuzz_min_len")]
        min_len: usize,
        #[serde(default = "default_fuzz_max_len")]
        max_len: usize,
    },

    /// Progressive compromise across a list of ECUs
    Lateral {
        target_ids: Vec<u32>,
        pattern: LateralPattern,
        #[serde(default = "default_base_dwell_ms")]
        base_dwell_ms: u64,
        interval_ms: u64,
    },
}

fn default_speed() -> f64 {
    1.0
}

fn default_fuzz_min_len() -> usize {
    1
}

fn default_fuzz_max_len() -> usize {
    MAX_PAYLOAD_LEN
}

fn default_base_dwell_ms() -> u64 {
    1000
}

impl AttackKind {
    /// Short machine-readable name used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            AttackKind::Injection { .. } => "injection",
            AttackKind::Spoof { .. } => "spoof",
            AttackKind::Replay { .. } => "replay",
            AttackKind::Flood { .. } => "flood",
            AttackKind::Fuzz { .. } => "fuzz",
            AttackKind::Lateral { .. } => "lateral",
        }
    }

    /// Static checks that need no I/O
    pub fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.label();
        match self {
            AttackKind::Injection {
                target_id,
                payload,
                interval_ms,
            } => {
                CanId::from_raw(*target_id)?;
                check_payload(payload)?;
                check_interval(kind, *interval_ms)
            }
            AttackKind::Spoof {
                target_id,
                interval_ms,
                ..
            } => {
                CanId::from_raw(*target_id)?;
                check_interval(kind, *interval_ms)
            }
            AttackKind::Replay {
                source,
                speed,
                id_filter,
            } => {
                if !speed.is_finite() || *speed <= 0.0 {
                    return Err(ConfigError::InvalidSpeed { speed: *speed });
                }
                for id in id_filter {
                    CanId::from_raw(*id)?;
                }
                source.validate()
            }
            AttackKind::Flood { target_id, payload } => {
                CanId::from_raw(*target_id)?;
                check_payload(payload)
            }
            AttackKind::Fuzz {
                target_ids,
                interval_ms,
                min_len,
                max_len,
                ..
            } => {
                check_targets(kind, target_ids)?;
                if min_len > max_len || *max_len > MAX_PAYLOAD_LEN {
                    return Err(ConfigError::InvalidFuzzLength {
                        min: *min_len,
                        max: *max_len,
                    });
                }
                check_interval(kind, *interval_ms)
            }
            AttackKind::Lateral {
                target_ids,
                base_dwell_ms,
                interval_ms,
                ..
            } => {
                check_targets(kind, target_ids)?;
                if *base_dwell_ms == 0 {
                    return Err(ConfigError::ZeroDwell);
                }
                check_interval(kind, *interval_ms)
            }
        }
    }

    /// Configured frames per second, for kinds that have a fixed cadence
    pub fn nominal_rate(&self) -> Option<f64> {
        let per_sec = |interval_ms: u64| 1000.0 / interval_ms.max(1) as f64;
        match self {
            AttackKind::Injection { interval_ms, .. }
            | AttackKind::Spoof { interval_ms, .. }
            | AttackKind::Fuzz { interval_ms, .. } => Some(per_sec(*interval_ms)),
            AttackKind::Lateral {
                target_ids,
                pattern,
                interval_ms,
                ..
            } => match pattern {
                LateralPattern::Simultaneous => {
                    Some(per_sec(*interval_ms) * target_ids.len() as f64)
                }
                _ => Some(per_sec(*interval_ms)),
            },
            AttackKind::Replay { .. } | AttackKind::Flood { .. } => None,
        }
    }

    /// Extra context recorded with every audit record of this attack
    pub fn audit_detail(&self) -> Option<String> {
        match self {
            AttackKind::Spoof {
                original_value,
                spoof_value,
                ..
            } => Some(format!("original={} spoofed={}", original_value, spoof_value)),
            _ => None,
        }
    }
}

fn check_payload(payload: &[u8]) -> Result<(), ConfigError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ConfigError::PayloadTooLong { len: payload.len() });
    }
    Ok(())
}

fn check_interval(kind: &'static str, interval_ms: u64) -> Result<(), ConfigError> {
    if interval_ms == 0 {
        return Err(ConfigError::ZeroInterval { kind });
    }
    Ok(())
}

fn check_targets(kind: &'static str, target_ids: &[u32]) -> Result<(), ConfigError> {
    if target_ids.is_empty() {
        return Err(ConfigError::EmptyTargets { kind });
    }
    for id in target_ids {
        CanId::from_raw(*id)?;
    }
    Ok(())
}

/// Attack configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Human-readable label (defaults to the attack kind)
    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub kind: AttackKind,

    /// Attack duration in milliseconds
    pub duration_ms: u64,

    /// Validate and log frames without transmitting them
    #[serde(default)]
    pub dry_run: bool,

    /// Run this step alongside the next scenario step
    #[serde(default)]
    pub concurrent_with_next: bool,
}

impl AttackConfig {
    pub fn new(kind: AttackKind, duration: Duration) -> Self {
        Self {
            name: kind.label().to_string(),
            kind,
            duration_ms: duration.as_millis() as u64,
            dry_run: false,
            concurrent_with_next: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn concurrent_with_next(mut self) -> Self {
        self.concurrent_with_next = true;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.kind.label()
        } else {
            &self.name
        }
    }
}

/// Lifecycle of a single attack run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackState {
    Idle,
    Validating,
    Running,
    Completed,
    Aborted,
}

impl AttackState {
    pub fn can_transition_to(self, next: AttackState) -> bool {
        matches!(
            (self, next),
            (AttackState::Idle, AttackState::Validating)
                | (AttackState::Validating, AttackState::Running)
                | (AttackState::Validating, AttackState::Aborted)
                | (AttackState::Running, AttackState::Completed)
                | (AttackState::Running, AttackState::Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AttackState::Completed | AttackState::Aborted)
    }
}

/// How an attack ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackOutcome {
    /// Ran for its full duration (or exhausted its source)
    Completed,
    /// Stopped by an emergency stop
    Aborted,
    /// A frame failed well-formedness checks mid-run
    ValidationFailed,
    /// The bus failed twice in a row
    TransportFailed,
    /// The scenario's wall-clock budget ran out
    BudgetExceeded,
}

impl fmt::Display for AttackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttackOutcome::Completed => "completed",
            AttackOutcome::Aborted => "aborted",
            AttackOutcome::ValidationFailed => "validation_failed",
            AttackOutcome::TransportFailed => "transport_failed",
            AttackOutcome::BudgetExceeded => "budget_exceeded",
        };
        write!(f, "{}", s)
    }
}

/// Attack result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackResult {
    pub name: String,
    pub kind: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// Frames handed to the bus (or that would have been, in a dry run)
    pub frames_sent: u64,

    /// Frames refused by the safety gate
    pub frames_blocked: u64,

    pub outcome: AttackOutcome,
    pub state: AttackState,
    pub dry_run: bool,

    /// Which check or frame ended the attack early
    pub detail: Option<String>,
}

impl AttackResult {
    pub fn frames_attempted(&self) -> u64 {
        self.frames_sent + self.frames_blocked
    }

    /// Blocked / attempted
    pub fn block_ratio(&self) -> f64 {
        let attempted = self.frames_attempted();
        if attempted == 0 {
            0.0
        } else {
            self.frames_blocked as f64 / attempted as f64
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

/// Emergency stop shared by every component of a run
///
/// Cloning shares the signal. A child token is stopped with its parent but
/// can also be stopped on its own.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    token: CancellationToken,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the token is stopped
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    pub fn child(&self) -> StopToken {
        StopToken {
            token: self.token.child_token(),
        }
    }
}

/// When a planned frame should go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Offset from the attack start
    At(Duration),
    /// As soon as the rate limiter permits
    Immediate,
}

/// One frame produced by a generator, not yet validated
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFrame {
    pub can_id: CanId,
    pub data: Vec<u8>,
    pub pace: Pace,
}
