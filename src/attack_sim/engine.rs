/// Attack Execution Engine
///
/// Drives one attack through `Idle -> Validating -> Running -> Completed |
/// Aborted`. While running, each planned frame waits for its slot, passes
/// the safety gate and is handed to the bus. The stop token is checked before
/// every send and interrupts every wait, so an emergency stop lands within
/// one interval.
use crate::attack_sim::fuzzing::FuzzGenerator;
use crate::attack_sim::injection::{FixedGenerator, FloodGenerator};
use crate::attack_sim::lateral::LateralGenerator;
use crate::attack_sim::replay::ReplaySchedule;
use crate::attack_sim::{
    AttackConfig, AttackKind, AttackOutcome, AttackResult, AttackState, Pace, PlannedFrame,
    StopToken,
};
use crate::can_bus::BusTransport;
use crate::error::{ConfigError, TransportError};
use crate::safety::{SafetyValidator, VerdictReason};
use crate::security_log::LogEvent;
use crate::types::{CanFrame, CanId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

/// Pause after a flood attempt that did not reach the bus
pub const FLOOD_BACKOFF: Duration = Duration::from_millis(1);

/// Wait before the single retry of a failed send
pub const TRANSPORT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Source name stamped on attack frames
pub const DEFAULT_SOURCE: &str = "CAN_HYDRA";

/// Per-kind frame producer
pub enum FrameGenerator {
    Fixed(FixedGenerator),
    Flood(FloodGenerator),
    Fuzz(FuzzGenerator),
    Replay(ReplaySchedule),
    Lateral(LateralGenerator),
}

impl FrameGenerator {
    /// Build the generator for an attack. Replay sources are loaded here.
    pub fn for_attack(kind: &AttackKind) -> Result<Self, ConfigError> {
        let ms = Duration::from_millis;
        Ok(match kind {
            AttackKind::Injection {
                target_id,
                payload,
                interval_ms,
            } => FrameGenerator::Fixed(FixedGenerator::new(
                CanId::from_raw(*target_id)?,
                payload.clone(),
                ms(*interval_ms),
            )),
            AttackKind::Spoof {
                target_id,
                spoof_value,
                interval_ms,
                ..
            } => FrameGenerator::Fixed(FixedGenerator::spoof(
                CanId::from_raw(*target_id)?,
                *spoof_value,
                ms(*interval_ms),
            )),
            AttackKind::Replay {
                source,
                speed,
                id_filter,
            } => FrameGenerator::Replay(ReplaySchedule::new(source.load()?, *speed, id_filter)?),
            AttackKind::Flood { target_id, payload } => FrameGenerator::Flood(
                FloodGenerator::new(CanId::from_raw(*target_id)?, payload.clone()),
            ),
            AttackKind::Fuzz {
                target_ids,
                seed,
                interval_ms,
                min_len,
                max_len,
            } => FrameGenerator::Fuzz(FuzzGenerator::new(
                parse_ids(target_ids)?,
                *seed,
                ms(*interval_ms),
                *min_len,
                *max_len,
            )),
            AttackKind::Lateral {
                target_ids,
                pattern,
                base_dwell_ms,
                interval_ms,
            } => FrameGenerator::Lateral(LateralGenerator::new(
                parse_ids(target_ids)?,
                *pattern,
                ms(*base_dwell_ms),
                ms(*interval_ms),
            )),
        })
    }

    pub fn next_frame(&mut self) -> Option<PlannedFrame> {
        match self {
            FrameGenerator::Fixed(g) => Some(g.next_frame()),
            FrameGenerator::Flood(g) => Some(g.next_frame()),
            FrameGenerator::Fuzz(g) => g.next_frame(),
            FrameGenerator::Replay(g) => g.next_frame(),
            FrameGenerator::Lateral(g) => g.next_frame(),
        }
    }
}

fn parse_ids(ids: &[u32]) -> Result<Vec<CanId>, ConfigError> {
    ids.iter().map(|id| CanId::from_raw(*id)).collect()
}

/// Attack validated and ready to run
pub struct PreparedAttack {
    pub config: AttackConfig,
    generator: FrameGenerator,
}

/// Mutable bookkeeping of one run
struct AttackRun {
    name: String,
    kind: &'static str,
    state: AttackState,
    start_time: DateTime<Utc>,
    frames_sent: u64,
    frames_blocked: u64,
    dry_run: bool,
}

impl AttackRun {
    fn new(config: &AttackConfig) -> Self {
        Self {
            name: config.display_name().to_string(),
            kind: config.kind.label(),
            state: AttackState::Idle,
            start_time: Utc::now(),
            frames_sent: 0,
            frames_blocked: 0,
            dry_run: config.dry_run,
        }
    }

    fn transition(&mut self, next: AttackState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal attack transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(attack = %self.name, from = ?self.state, to = ?next, "attack state");
        self.state = next;
    }

    fn finish(mut self, outcome: AttackOutcome, detail: Option<String>) -> AttackResult {
        let terminal = if outcome == AttackOutcome::Completed {
            AttackState::Completed
        } else {
            AttackState::Aborted
        };
        self.transition(terminal);

        info!(
            attack = %self.name,
            kind = self.kind,
            sent = self.frames_sent,
            blocked = self.frames_blocked,
            dry_run = self.dry_run,
            outcome = %outcome,
            "attack finished"
        );

        AttackResult {
            name: self.name,
            kind: self.kind.to_string(),
            start_time: self.start_time,
            end_time: Utc::now(),
            frames_sent: self.frames_sent,
            frames_blocked: self.frames_blocked,
            outcome,
            state: self.state,
            dry_run: self.dry_run,
            detail,
        }
    }
}

/// Runs attacks against a shared transport through a shared safety gate
#[derive(Clone)]
pub struct AttackEngine {
    transport: Arc<dyn BusTransport>,
    validator: Arc<SafetyValidator>,
}

impl AttackEngine {
    pub fn new(transport: Arc<dyn BusTransport>, validator: Arc<SafetyValidator>) -> Self {
        Self {
            transport,
            validator,
        }
    }

    pub fn validator(&self) -> &Arc<SafetyValidator> {
        &self.validator
    }

    pub fn transport(&self) -> &Arc<dyn BusTransport> {
        &self.transport
    }

    /// Static validation and generator construction; nothing is sent
    pub fn prepare(&self, config: &AttackConfig) -> Result<PreparedAttack, ConfigError> {
        self.validator.validate_config(config)?;
        let generator = FrameGenerator::for_attack(&config.kind)?;
        Ok(PreparedAttack {
            config: config.clone(),
            generator,
        })
    }

    /// Validate and run one attack to completion
    ///
    /// Config failures are returned before the attack reaches `Running`.
    /// Blocked frames, stops and transport failures end up in the result.
    pub async fn run(
        &self,
        config: &AttackConfig,
        stop: &StopToken,
    ) -> Result<AttackResult, ConfigError> {
        let mut run = AttackRun::new(config);
        run.transition(AttackState::Validating);

        let prepared = match self.prepare(config) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(attack = %run.name, error = %e, "attack rejected");
                run.transition(AttackState::Aborted);
                return Err(e);
            }
        };

        self.start(run, prepared, stop).await
    }

    /// Run an attack that already passed [`AttackEngine::prepare`]
    pub async fn run_prepared(
        &self,
        prepared: PreparedAttack,
        stop: &StopToken,
    ) -> Result<AttackResult, ConfigError> {
        let mut run = AttackRun::new(&prepared.config);
        run.transition(AttackState::Validating);
        self.start(run, prepared, stop).await
    }

    async fn start(
        &self,
        mut run: AttackRun,
        prepared: PreparedAttack,
        stop: &StopToken,
    ) -> Result<AttackResult, ConfigError> {
        let _slot = match self.validator.register_attack() {
            Ok(slot) => slot,
            Err(e) => {
                warn!(attack = %run.name, error = %e, "attack rejected");
                run.transition(AttackState::Aborted);
                return Err(e);
            }
        };

        let PreparedAttack {
            config,
            mut generator,
        } = prepared;

        run.transition(AttackState::Running);
        run.start_time = Utc::now();
        info!(
            attack = %run.name,
            kind = run.kind,
            duration_ms = config.duration_ms,
            dry_run = config.dry_run,
            channel = self.transport.channel_name(),
            "attack started"
        );
        let parameters = serde_json::to_string(&config)
            .unwrap_or_else(|e| format!("unserializable config: {}", e));
        self.audit_lifecycle(&config, "attack_start", parameters);

        let (outcome, detail) = self.drive(&config, &mut generator, &mut run, stop).await;
        self.audit_lifecycle(
            &config,
            "attack_end",
            format!(
                "outcome={} sent={} blocked={} dry_run={}",
                outcome, run.frames_sent, run.frames_blocked, run.dry_run
            ),
        );
        Ok(run.finish(outcome, detail))
    }

    /// One audit record per attack start and end, next to the per-frame verdicts
    fn audit_lifecycle(&self, config: &AttackConfig, outcome: &str, detail: String) {
        self.validator.audit().append(LogEvent {
            component: "engine".to_string(),
            kind: config.kind.label().to_string(),
            frame_id: None,
            payload_hex: None,
            outcome: outcome.to_string(),
            detail: Some(detail),
        });
    }

    async fn drive(
        &self,
        config: &AttackConfig,
        generator: &mut FrameGenerator,
        run: &mut AttackRun,
        stop: &StopToken,
    ) -> (AttackOutcome, Option<String>) {
        let start = Instant::now();
        let duration = config.duration();

        loop {
            if stop.is_stopped() {
                return (AttackOutcome::Aborted, None);
            }

            let Some(planned) = generator.next_frame() else {
                return (AttackOutcome::Completed, None);
            };

            let unpaced = match planned.pace {
                Pace::At(offset) => {
                    if offset >= duration {
                        return (AttackOutcome::Completed, None);
                    }
                    if !wait_until(start + offset, stop).await {
                        return (AttackOutcome::Aborted, None);
                    }
                    false
                }
                Pace::Immediate => true,
            };

            if start.elapsed() >= duration {
                return (AttackOutcome::Completed, None);
            }

            let frame = CanFrame::new(planned.can_id, planned.data, DEFAULT_SOURCE.to_string());
            let verdict = self.validator.validate(&frame, config);

            if verdict.dry_run {
                run.frames_sent += 1;
                if unpaced && !wait_until(Instant::now() + FLOOD_BACKOFF, stop).await {
                    return (AttackOutcome::Aborted, None);
                }
                continue;
            }

            if !verdict.allowed {
                run.frames_blocked += 1;
                if verdict.reason == VerdictReason::MalformedPayload {
                    return (
                        AttackOutcome::ValidationFailed,
                        Some(format!(
                            "frame {} failed payload check ({} data bytes)",
                            frame.id,
                            frame.data.len()
                        )),
                    );
                }
                if unpaced && !wait_until(Instant::now() + FLOOD_BACKOFF, stop).await {
                    return (AttackOutcome::Aborted, None);
                }
                continue;
            }

            if let Err(e) = self.send_with_retry(&frame, config).await {
                return (
                    AttackOutcome::TransportFailed,
                    Some(format!("send of frame {} failed: {}", frame.id, e)),
                );
            }
            run.frames_sent += 1;

            if unpaced {
                tokio::task::yield_now().await;
            }
        }
    }

    /// One retry after a fixed backoff, then give up
    async fn send_with_retry(
        &self,
        frame: &CanFrame,
        config: &AttackConfig,
    ) -> Result<(), TransportError> {
        let Err(first) = self.transport.send(frame.clone()).await else {
            return Ok(());
        };

        warn!(
            attack = %config.display_name(),
            can_id = %frame.id,
            error = %first,
            "send failed, retrying"
        );
        sleep(TRANSPORT_RETRY_BACKOFF).await;

        let result = self.transport.send(frame.clone()).await;
        if let Err(e) = &result {
            self.validator.audit().append(LogEvent {
                component: "engine".to_string(),
                kind: config.kind.label().to_string(),
                frame_id: Some(frame.id.value()),
                payload_hex: Some(frame.payload_hex()),
                outcome: "transport_failed".to_string(),
                detail: Some(e.to_string()),
            });
        }
        result
    }
}

/// Sleep until `deadline`; false if the stop token fired first
async fn wait_until(deadline: Instant, stop: &StopToken) -> bool {
    tokio::select! {
        biased;
        _ = stop.stopped() => false,
        _ = sleep_until(deadline) => true,
    }
}
