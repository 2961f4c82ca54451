/// Attack Orchestration Framework
///
/// Runs named scenarios (ordered attack steps with prerequisites) on one
/// engine, enforcing the prerequisite check and an overall wall-clock budget.
use crate::attack_sim::engine::{AttackEngine, PreparedAttack};
use crate::attack_sim::{AttackConfig, AttackOutcome, AttackResult, AttackState, StopToken};
use crate::error::{ConfigError, ScenarioError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difficulty::Easy => write!(f, "Easy"),
            Difficulty::Medium => write!(f, "Medium"),
            Difficulty::Hard => write!(f, "Hard"),
        }
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(format!("unknown difficulty '{}'", other)),
        }
    }
}

/// Attack scenario definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Lookup key
    pub name: String,

    pub title: String,
    pub description: String,
    pub category: String,
    pub difficulty: Difficulty,

    /// Executed in order; a step marked `concurrent_with_next` overlaps the next one
    pub steps: Vec<AttackConfig>,

    /// Capabilities that must be reachable before any frame is sent
    #[serde(default)]
    pub prerequisites: BTreeSet<String>,

    #[serde(default)]
    pub expected_impact: String,
}

impl Scenario {
    /// Sum of all step durations
    pub fn planned_duration(&self) -> Duration {
        self.steps.iter().map(|s| s.duration()).sum()
    }

    /// Index ranges of steps that run together
    pub fn step_groups(&self) -> Vec<std::ops::Range<usize>> {
        let mut groups = Vec::new();
        let mut start = 0;
        for (i, step) in self.steps.iter().enumerate() {
            if !step.concurrent_with_next || i + 1 == self.steps.len() {
                groups.push(start..i + 1);
                start = i + 1;
            }
        }
        groups
    }
}

/// Lookup of scenarios by name
pub trait ScenarioSource: Send + Sync {
    fn scenario(&self, name: &str) -> Option<Scenario>;
}

/// Named scenarios: the built-in set plus any loaded from JSON
#[derive(Debug, Clone, Default)]
pub struct ScenarioLibrary {
    scenarios: BTreeMap<String, Scenario>,
}

impl ScenarioLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut library = Self::new();
        for scenario in scenarios::all() {
            library.insert(scenario);
        }
        library
    }

    /// Insert or replace a scenario under its name
    pub fn insert(&mut self, scenario: Scenario) {
        self.scenarios.insert(scenario.name.clone(), scenario);
    }

    /// Load a JSON array of scenarios; returns how many were added
    pub fn load_json_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let loaded: Vec<Scenario> =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let count = loaded.len();
        for scenario in loaded {
            self.insert(scenario);
        }
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.get(name)
    }

    /// Scenarios matching the optional filters, sorted by name
    pub fn list(&self, category: Option<&str>, difficulty: Option<Difficulty>) -> Vec<&Scenario> {
        self.scenarios
            .values()
            .filter(|s| category.is_none_or(|c| s.category.eq_ignore_ascii_case(c)))
            .filter(|s| difficulty.is_none_or(|d| s.difficulty == d))
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.scenarios.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

impl ScenarioSource for ScenarioLibrary {
    fn scenario(&self, name: &str) -> Option<Scenario> {
        self.get(name).cloned()
    }
}

/// Whether a named prerequisite is currently reachable
pub trait CapabilityRegistry: Send + Sync {
    fn is_available(&self, capability: &str) -> bool;
}

/// Fixed set of declared capabilities
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilities {
    available: HashSet<String>,
}

impl StaticCapabilities {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            available: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn declare(&mut self, capability: impl Into<String>) {
        self.available.insert(capability.into());
    }
}

impl CapabilityRegistry for StaticCapabilities {
    fn is_available(&self, capability: &str) -> bool {
        self.available.contains(capability)
    }
}

/// How a scenario run ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Completed,
    /// Emergency stop from the caller
    Stopped,
    BudgetExceeded,
}

/// Scenario execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// One result per executed step, in declared order
    pub results: Vec<AttackResult>,

    pub outcome: ScenarioOutcome,
    pub budget_ms: u64,
}

impl ScenarioReport {
    pub fn total_frames_sent(&self) -> u64 {
        self.results.iter().map(|r| r.frames_sent).sum()
    }

    pub fn total_frames_blocked(&self) -> u64 {
        self.results.iter().map(|r| r.frames_blocked).sum()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

/// Default slack added to the sum of step durations
pub const DEFAULT_BUDGET_OVERHEAD: Duration = Duration::from_secs(1);

/// Scenario orchestrator
pub struct ScenarioOrchestrator {
    engine: AttackEngine,
    capabilities: Arc<dyn CapabilityRegistry>,
    budget_overhead: Duration,
    dry_run: bool,
}

impl ScenarioOrchestrator {
    pub fn new(engine: AttackEngine, capabilities: Arc<dyn CapabilityRegistry>) -> Self {
        Self {
            engine,
            capabilities,
            budget_overhead: DEFAULT_BUDGET_OVERHEAD,
            dry_run: false,
        }
    }

    pub fn with_budget_overhead(mut self, overhead: Duration) -> Self {
        self.budget_overhead = overhead;
        self
    }

    /// Force every step into dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn budget_for(&self, scenario: &Scenario) -> Duration {
        scenario.planned_duration() + self.budget_overhead
    }

    /// Look up a scenario by name and run it
    pub async fn run_named(
        &self,
        source: &dyn ScenarioSource,
        name: &str,
        stop: &StopToken,
    ) -> Result<ScenarioReport, ScenarioError> {
        let scenario = source
            .scenario(name)
            .ok_or_else(|| ScenarioError::UnknownScenario(name.to_string()))?;
        self.run(&scenario, stop).await
    }

    /// Execute a scenario
    ///
    /// Prerequisites and every step's static config are checked first; any
    /// failure returns an error before a single frame is sent. After that the
    /// scenario runs to the end even when steps report blocked frames.
    pub async fn run(
        &self,
        scenario: &Scenario,
        stop: &StopToken,
    ) -> Result<ScenarioReport, ScenarioError> {
        self.check_prerequisites(scenario)?;
        let mut prepared = self.prepare_steps(scenario)?;

        let budget = self.budget_for(scenario);
        let start_time = Utc::now();
        info!(
            scenario = %scenario.name,
            steps = scenario.steps.len(),
            budget_ms = budget.as_millis() as u64,
            dry_run = self.dry_run,
            "scenario started"
        );

        // The budget timer stops this run only; the caller's token stays untouched
        let run_stop = stop.child();
        let budget_hit = Arc::new(AtomicBool::new(false));
        let timer = {
            let run_stop = run_stop.clone();
            let budget_hit = Arc::clone(&budget_hit);
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                budget_hit.store(true, Ordering::SeqCst);
                run_stop.stop();
            })
        };

        let mut results = Vec::with_capacity(scenario.steps.len());
        let mut steps_skipped = false;
        for group in scenario.step_groups() {
            if run_stop.is_stopped() {
                steps_skipped = true;
                break;
            }
            let steps: Vec<PreparedAttack> = prepared.drain(..group.len()).collect();
            results.extend(self.run_group(steps, &run_stop).await);
        }
        timer.abort();

        let outcome = settle_outcome(
            &mut results,
            budget_hit.load(Ordering::SeqCst),
            stop.is_stopped(),
            steps_skipped,
        );
        if outcome == ScenarioOutcome::BudgetExceeded {
            warn!(scenario = %scenario.name, budget_ms = budget.as_millis() as u64, "scenario budget exceeded");
        }

        let report = ScenarioReport {
            scenario: scenario.name.clone(),
            start_time,
            end_time: Utc::now(),
            results,
            outcome,
            budget_ms: budget.as_millis() as u64,
        };

        info!(
            scenario = %scenario.name,
            steps_run = report.results.len(),
            sent = report.total_frames_sent(),
            blocked = report.total_frames_blocked(),
            outcome = ?report.outcome,
            "scenario finished"
        );

        Ok(report)
    }

    fn check_prerequisites(&self, scenario: &Scenario) -> Result<(), ScenarioError> {
        let missing: Vec<String> = scenario
            .prerequisites
            .iter()
            .filter(|p| !self.capabilities.is_available(p))
            .cloned()
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        warn!(scenario = %scenario.name, missing = ?missing, "prerequisites missing");
        Err(ScenarioError::PrerequisiteMissing {
            scenario: scenario.name.clone(),
            missing,
        })
    }

    fn prepare_steps(&self, scenario: &Scenario) -> Result<Vec<PreparedAttack>, ScenarioError> {
        let max = self.engine.validator().limits().max_concurrent_attacks;
        for group in scenario.step_groups() {
            if group.len() > max {
                return Err(ScenarioError::Config {
                    step: group.start,
                    attack: scenario.steps[group.start].display_name().to_string(),
                    source: ConfigError::TooManyConcurrentAttacks {
                        active: group.len(),
                        max,
                    },
                });
            }
        }

        scenario
            .steps
            .iter()
            .enumerate()
            .map(|(step, config)| {
                let mut config = config.clone();
                config.dry_run |= self.dry_run;
                self.engine
                    .prepare(&config)
                    .map_err(|source| ScenarioError::Config {
                        step,
                        attack: config.display_name().to_string(),
                        source,
                    })
            })
            .collect()
    }

    async fn run_group(&self, steps: Vec<PreparedAttack>, stop: &StopToken) -> Vec<AttackResult> {
        if steps.len() == 1 {
            let Some(step) = steps.into_iter().next() else {
                return Vec::new();
            };
            let config = step.config.clone();
            return vec![
                self.engine
                    .run_prepared(step, stop)
                    .await
                    .unwrap_or_else(|e| unstarted(&config, e.to_string())),
            ];
        }

        let handles: Vec<_> = steps
            .into_iter()
            .map(|step| {
                let config = step.config.clone();
                let engine = self.engine.clone();
                let stop = stop.clone();
                let handle = tokio::spawn(async move { engine.run_prepared(step, &stop).await });
                (config, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (config, handle) in handles {
            let result = match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => unstarted(&config, e.to_string()),
                Err(e) => unstarted(&config, format!("step task failed: {}", e)),
            };
            results.push(result);
        }
        results
    }
}

/// Scenario outcome once every group has returned
///
/// The budget counts as exceeded only if it actually cut something short:
/// a step aborted or a group never started. A timer that fires after the
/// last step completed leaves the scenario `Completed`.
fn settle_outcome(
    results: &mut [AttackResult],
    budget_hit: bool,
    caller_stopped: bool,
    steps_skipped: bool,
) -> ScenarioOutcome {
    let cut_short =
        steps_skipped || results.iter().any(|r| r.outcome == AttackOutcome::Aborted);

    if budget_hit && cut_short {
        for result in results.iter_mut() {
            if result.outcome == AttackOutcome::Aborted {
                result.outcome = AttackOutcome::BudgetExceeded;
            }
        }
        ScenarioOutcome::BudgetExceeded
    } else if caller_stopped {
        ScenarioOutcome::Stopped
    } else {
        ScenarioOutcome::Completed
    }
}

/// Result for a step rejected at start (e.g. no free attack slot)
fn unstarted(config: &AttackConfig, detail: String) -> AttackResult {
    let now = Utc::now();
    AttackResult {
        name: config.display_name().to_string(),
        kind: config.kind.label().to_string(),
        start_time: now,
        end_time: now,
        frames_sent: 0,
        frames_blocked: 0,
        outcome: AttackOutcome::ValidationFailed,
        state: AttackState::Aborted,
        dry_run: config.dry_run,
        detail: Some(detail),
    }
}

/// Predefined attack scenarios
pub mod scenarios {
    use super::*;
    use crate::attack_sim::{AttackKind, LateralPattern, ReplaySource};
    use crate::types::can_ids::{
        BODY_CONTROL, BRAKE_SYSTEM, INFOTAINMENT, SAFETY_SYSTEMS, SPEED_SENSOR, TELEMATICS,
    };

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[allow(clippy::too_many_arguments)]
    fn scenario(
        name: &str,
        title: &str,
        description: &str,
        category: &str,
        difficulty: Difficulty,
        prerequisites: &[&str],
        expected_impact: &str,
        steps: Vec<AttackConfig>,
    ) -> Scenario {
        Scenario {
            name: name.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            difficulty,
            steps,
            prerequisites: prerequisites.iter().map(|p| p.to_string()).collect(),
            expected_impact: expected_impact.to_string(),
        }
    }

    pub fn all() -> Vec<Scenario> {
        vec![
            speed_spoofing(),
            speed_flooding(),
            ecu_lateral_movement(),
            message_replay(),
            apt_simulation(),
            brake_system_attack(),
            segmentation_test(),
        ]
    }

    /// Spoof speed sensor readings
    pub fn speed_spoofing() -> Scenario {
        scenario(
            "speed_spoofing",
            "Speed Sensor Spoofing",
            "Spoof speed sensor readings to manipulate vehicle speed display",
            "Sensor Spoofing",
            Difficulty::Easy,
            &["Speed ECU running"],
            "Incorrect speed readings, potential safety issues",
            vec![AttackConfig::new(
                AttackKind::Spoof {
                    target_id: SPEED_SENSOR.value(),
                    original_value: 50,
                    spoof_value: 255,
                    interval_ms: 100,
                },
                secs(30),
            )],
        )
    }

    /// Flood the speed sensor ID
    pub fn speed_flooding() -> Scenario {
        scenario(
            "speed_flooding",
            "Speed Sensor Flooding",
            "Flood speed sensor with high-rate messages to cause DoS",
            "Denial of Service",
            Difficulty::Easy,
            &["Speed ECU running"],
            "ECU overload, potential system freeze",
            vec![AttackConfig::new(
                AttackKind::Flood {
                    target_id: SPEED_SENSOR.value(),
                    payload: vec![0xFF],
                },
                secs(15),
            )],
        )
    }

    pub fn ecu_lateral_movement() -> Scenario {
        scenario(
            "ecu_lateral_movement",
            "ECU Lateral Movement",
            "Progressive attack across multiple ECUs to establish persistence",
            "Lateral Movement",
            Difficulty::Medium,
            &["Multiple ECUs running"],
            "Compromise of multiple vehicle systems",
            vec![AttackConfig::new(
                AttackKind::Lateral {
                    target_ids: vec![
                        SPEED_SENSOR.value(),
                        SAFETY_SYSTEMS.value(),
                        BODY_CONTROL.value(),
                        INFOTAINMENT.value(),
                    ],
                    pattern: LateralPattern::Escalate,
                    base_dwell_ms: 1000,
                    interval_ms: 500,
                },
                secs(60),
            )],
        )
    }

    /// Replays the monitor's capture file
    pub fn message_replay() -> Scenario {
        scenario(
            "message_replay",
            "Message Replay Attack",
            "Replay captured legitimate messages to bypass authentication",
            "Replay Attack",
            Difficulty::Medium,
            &["Captured message log"],
            "Bypass security controls, unauthorized actions",
            vec![AttackConfig::new(
                AttackKind::Replay {
                    source: ReplaySource::file("attack_logs/capture.jsonl"),
                    speed: 1.5,
                    id_filter: vec![SPEED_SENSOR.value(), SAFETY_SYSTEMS.value()],
                },
                secs(45),
            )],
        )
    }

    /// Four phases: reconnaissance, initial access, lateral movement, persistence
    pub fn apt_simulation() -> Scenario {
        scenario(
            "apt_simulation",
            "APT Simulation",
            "Simulate advanced persistent threat with multiple attack phases",
            "Advanced Persistent Threat",
            Difficulty::Hard,
            &["Full ECU simulation", "Network monitoring"],
            "Complete vehicle system compromise",
            vec![
                AttackConfig::new(
                    AttackKind::Lateral {
                        target_ids: vec![
                            SPEED_SENSOR.value(),
                            SAFETY_SYSTEMS.value(),
                            BODY_CONTROL.value(),
                        ],
                        pattern: LateralPattern::Sequential,
                        base_dwell_ms: 1000,
                        interval_ms: 1000,
                    },
                    secs(30),
                )
                .named("reconnaissance"),
                AttackConfig::new(
                    AttackKind::Spoof {
                        target_id: SPEED_SENSOR.value(),
                        original_value: 50,
                        spoof_value: 220,
                        interval_ms: 100,
                    },
                    secs(60),
                )
                .named("initial_access"),
                AttackConfig::new(
                    AttackKind::Lateral {
                        target_ids: vec![
                            SAFETY_SYSTEMS.value(),
                            BODY_CONTROL.value(),
                            INFOTAINMENT.value(),
                        ],
                        pattern: LateralPattern::Escalate,
                        base_dwell_ms: 5000,
                        interval_ms: 500,
                    },
                    secs(120),
                )
                .named("lateral_movement"),
                AttackConfig::new(
                    AttackKind::Injection {
                        target_id: TELEMATICS.value(),
                        payload: vec![0x01],
                        interval_ms: 5000,
                    },
                    secs(90),
                )
                .named("persistence"),
            ],
        )
    }

    /// Targets a denylisted ID: every frame is expected to be blocked
    pub fn brake_system_attack() -> Scenario {
        scenario(
            "brake_system_attack",
            "Brake System Manipulation",
            "Attempt to manipulate brake system messages",
            "Safety System Attack",
            Difficulty::Hard,
            &["Brake ECU simulation"],
            "CRITICAL: Potential brake system compromise",
            vec![AttackConfig::new(
                AttackKind::Spoof {
                    target_id: BRAKE_SYSTEM.value(),
                    original_value: 0,
                    spoof_value: 1,
                    interval_ms: 50,
                },
                secs(20),
            )],
        )
    }

    /// One concurrent sweep per network domain
    pub fn segmentation_test() -> Scenario {
        let domain = |name: &str, ids: Vec<u32>| {
            AttackConfig::new(
                AttackKind::Lateral {
                    target_ids: ids,
                    pattern: LateralPattern::Simultaneous,
                    base_dwell_ms: 1000,
                    interval_ms: 1000,
                },
                secs(30),
            )
            .named(name)
        };

        scenario(
            "segmentation_test",
            "Network Segmentation Test",
            "Test network segmentation by attempting cross-domain communication",
            "Network Segmentation",
            Difficulty::Medium,
            &["Multi-domain ECU simulation"],
            "Validation of network segmentation effectiveness",
            vec![
                domain("powertrain", vec![0x100, 0x101, 0x102]).concurrent_with_next(),
                domain("body", vec![0x200, 0x201, 0x202]).concurrent_with_next(),
                domain("infotainment", vec![0x300, 0x301, 0x302]),
            ],
        )
    }
}
