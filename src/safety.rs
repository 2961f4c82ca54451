/// Safety Gate
///
/// Every outgoing frame passes through [`SafetyValidator::validate`] before it
/// may reach the bus. Checks run in a fixed order (ID policy, payload
/// well-formedness, global rate limit) and the first failing check decides
/// the verdict. Every verdict is written to the audit log exactly once.
use crate::attack_sim::{AttackConfig, AttackKind};
use crate::error::ConfigError;
use crate::rate_limiter::RateLimiter;
use crate::security_log::{LogEvent, LogSink};
use crate::types::{CanFrame, CanId, MAX_PAYLOAD_LEN, can_ids};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Static safety limits applied to every attack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Highest configured message rate (msg/s) for paced attacks
    pub max_rate: u32,

    /// Longest allowed attack duration in seconds
    pub max_duration_secs: u64,

    /// Attacks allowed to run at the same time
    pub max_concurrent_attacks: usize,

    /// IDs no attack frame may carry
    ///
    /// Defaults to the four control IDs (engine, transmission, brake,
    /// steering). Speed sensor and safety-system IDs stay reachable so the
    /// built-in scenarios can target them; list them here to deny them too.
    pub denied_ids: Vec<u32>,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_rate: 1000,
            max_duration_secs: 60 * 60,
            max_concurrent_attacks: 5,
            denied_ids: vec![
                can_ids::ENGINE_CONTROL.value(),
                can_ids::TRANSMISSION.value(),
                can_ids::BRAKE_SYSTEM.value(),
                can_ids::STEERING.value(),
            ],
        }
    }
}

/// Why a frame was (or was not) allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    Allowed,
    BlockedId,
    MalformedPayload,
    RateLimited,
    DryRun,
}

impl VerdictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictReason::Allowed => "allowed",
            VerdictReason::BlockedId => "blocked_id",
            VerdictReason::MalformedPayload => "malformed_payload",
            VerdictReason::RateLimited => "rate_limited",
            VerdictReason::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-frame gate decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub allowed: bool,
    pub reason: VerdictReason,
    pub dry_run: bool,
}

impl ValidationVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: VerdictReason::Allowed,
            dry_run: false,
        }
    }

    fn block(reason: VerdictReason) -> Self {
        Self {
            allowed: false,
            reason,
            dry_run: false,
        }
    }

    fn dry_run() -> Self {
        Self {
            allowed: true,
            reason: VerdictReason::DryRun,
            dry_run: true,
        }
    }
}

/// Per-frame and per-config safety checks plus the active-attack count
pub struct SafetyValidator {
    limits: SafetyLimits,
    denylist: HashSet<CanId>,
    rate_limiter: RateLimiter,
    audit: Arc<dyn LogSink>,
    active_attacks: Arc<AtomicUsize>,
}

impl SafetyValidator {
    pub fn new(limits: SafetyLimits, rate_limiter: RateLimiter, audit: Arc<dyn LogSink>) -> Self {
        let denylist = limits
            .denied_ids
            .iter()
            .filter_map(|id| CanId::from_raw(*id).ok())
            .collect();

        Self {
            limits,
            denylist,
            rate_limiter,
            audit,
            active_attacks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Gate one frame
    ///
    /// In a dry run the verdict is always `allowed` with `dry_run = true` and
    /// no rate-limit slot is taken. The policy checks still run so the audit
    /// record shows what a live run would have done.
    pub fn validate(&self, frame: &CanFrame, config: &AttackConfig) -> ValidationVerdict {
        let policy = self.policy_check(frame);

        let verdict = if config.dry_run {
            ValidationVerdict::dry_run()
        } else {
            match policy {
                Some(reason) => ValidationVerdict::block(reason),
                None if !self.rate_limiter.try_acquire() => {
                    ValidationVerdict::block(VerdictReason::RateLimited)
                }
                None => ValidationVerdict::allow(),
            }
        };

        let mut detail: Vec<String> = Vec::new();
        if let Some(spoof) = config.kind.audit_detail() {
            detail.push(spoof);
        }
        if config.dry_run
            && let Some(reason) = policy
        {
            detail.push(format!("would_block={}", reason));
        }

        self.audit.append(LogEvent {
            component: "safety".to_string(),
            kind: config.kind.label().to_string(),
            frame_id: Some(frame.id.value()),
            payload_hex: Some(frame.payload_hex()),
            outcome: verdict.reason.as_str().to_string(),
            detail: (!detail.is_empty()).then(|| detail.join(" ")),
        });

        verdict
    }

    /// ID policy then payload well-formedness; `None` when both pass
    fn policy_check(&self, frame: &CanFrame) -> Option<VerdictReason> {
        if self.denylist.contains(&frame.id) {
            Some(VerdictReason::BlockedId)
        } else if frame.data.len() > MAX_PAYLOAD_LEN || !frame.id.is_valid() {
            Some(VerdictReason::MalformedPayload)
        } else {
            None
        }
    }

    /// Static checks run once before an attack starts
    pub fn validate_config(&self, config: &AttackConfig) -> Result<(), ConfigError> {
        if config.duration_ms == 0 {
            return Err(ConfigError::ZeroDuration);
        }

        let max_ms = self.limits.max_duration_secs.saturating_mul(1000);
        if config.duration_ms > max_ms {
            return Err(ConfigError::DurationExceedsLimit {
                requested_secs: config.duration_ms.div_ceil(1000),
                max_secs: self.limits.max_duration_secs,
            });
        }

        config.kind.validate()?;

        if let Some(rate) = config.kind.nominal_rate()
            && rate > self.limits.max_rate as f64
        {
            return Err(ConfigError::RateExceedsLimit {
                rate,
                max: self.limits.max_rate,
            });
        }

        if let AttackKind::Flood { .. } = config.kind
            && self.rate_limiter.max_rate() == 0
        {
            return Err(ConfigError::InvalidValue {
                field: "rate_limit.max_rate",
                reason: "flood cannot make progress with a zero rate limit".to_string(),
            });
        }

        Ok(())
    }

    /// Claim one of the concurrent attack slots until the guard is dropped
    pub fn register_attack(&self) -> Result<ActiveAttackGuard, ConfigError> {
        let max = self.limits.max_concurrent_attacks;
        self.active_attacks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < max).then_some(active + 1)
            })
            .map_err(|active| ConfigError::TooManyConcurrentAttacks { active, max })?;

        Ok(ActiveAttackGuard {
            active: Arc::clone(&self.active_attacks),
        })
    }

    pub fn active_attacks(&self) -> usize {
        self.active_attacks.load(Ordering::Acquire)
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn audit(&self) -> &Arc<dyn LogSink> {
        &self.audit
    }
}

/// Releases a concurrent attack slot on drop
#[derive(Debug)]
pub struct ActiveAttackGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveAttackGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
