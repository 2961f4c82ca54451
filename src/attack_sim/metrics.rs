/// Attack Metrics and Reporting
///
/// Aggregates attack results into totals and renders text reports
use crate::attack_sim::orchestrator::{ScenarioOutcome, ScenarioReport};
use crate::attack_sim::{AttackOutcome, AttackResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Aggregate attack metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttackMetrics {
    /// Total attacks executed
    pub total_attacks: usize,

    /// Attacks by kind label
    pub attacks_by_kind: HashMap<String, usize>,

    /// Attacks by outcome
    pub outcomes: HashMap<AttackOutcome, usize>,

    pub total_frames_sent: u64,
    pub total_frames_blocked: u64,

    /// Blocked / attempted across all attacks
    pub block_ratio: f64,

    /// Attacks that ran without transmitting
    pub dry_run_attacks: usize,

    pub total_duration_ms: i64,
}

impl AttackMetrics {
    /// Compute metrics from a list of attack results
    pub fn from_results(results: &[AttackResult]) -> Self {
        let mut metrics = Self {
            total_attacks: results.len(),
            ..Self::default()
        };

        for result in results {
            *metrics
                .attacks_by_kind
                .entry(result.kind.clone())
                .or_insert(0) += 1;
            *metrics.outcomes.entry(result.outcome).or_insert(0) += 1;

            metrics.total_frames_sent += result.frames_sent;
            metrics.total_frames_blocked += result.frames_blocked;
            metrics.total_duration_ms += result.duration_ms();

            if result.dry_run {
                metrics.dry_run_attacks += 1;
            }
        }

        let attempted = metrics.total_frames_attempted();
        if attempted > 0 {
            metrics.block_ratio = metrics.total_frames_blocked as f64 / attempted as f64;
        }

        metrics
    }

    pub fn total_frames_attempted(&self) -> u64 {
        self.total_frames_sent + self.total_frames_blocked
    }

    pub fn outcome_count(&self, outcome: AttackOutcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Generate a text report
    pub fn generate_report(&self) -> String {
        let mut report = String::new();

        report.push('\n');
        report.push_str("╔══════════════════════════════════════════════════════════════╗\n");
        report.push_str("║              ATTACK SIMULATION METRICS REPORT                ║\n");
        report.push_str("╚══════════════════════════════════════════════════════════════╝\n");
        report.push('\n');

        report.push_str("OVERVIEW\n");
        report.push_str("--------\n");
        report.push_str(&format!("Total Attacks Executed:    {}\n", self.total_attacks));
        report.push_str(&format!("Dry-Run Attacks:           {}\n", self.dry_run_attacks));
        report.push_str(&format!(
            "Total Duration:            {} ms ({:.2} seconds)\n",
            self.total_duration_ms,
            self.total_duration_ms as f64 / 1000.0
        ));
        report.push('\n');

        report.push_str("FRAME STATISTICS\n");
        report.push_str("----------------\n");
        report.push_str(&format!("Frames Sent:               {}\n", self.total_frames_sent));
        report.push_str(&format!(
            "Frames Blocked:            {}\n",
            self.total_frames_blocked
        ));
        report.push_str(&format!(
            "Block Ratio:               {:.2}%\n",
            self.block_ratio * 100.0
        ));
        report.push('\n');

        report.push_str("OUTCOMES\n");
        report.push_str("--------\n");
        let mut outcomes: Vec<_> = self.outcomes.iter().collect();
        outcomes.sort_by_key(|(outcome, _)| outcome.to_string());
        for (outcome, count) in outcomes {
            report.push_str(&format!("  {:30} {}\n", outcome.to_string(), count));
        }
        report.push('\n');

        report.push_str("ATTACKS BY KIND\n");
        report.push_str("---------------\n");
        let mut kinds: Vec<_> = self.attacks_by_kind.iter().collect();
        kinds.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (kind, count) in kinds {
            report.push_str(&format!("  {:30} {}\n", kind, count));
        }
        report.push('\n');

        report.push_str("══════════════════════════════════════════════════════════════\n");

        report
    }
}

/// Side-by-side summary of several scenario runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioComparison {
    pub scenarios: Vec<ScenarioSummary>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub outcome: ScenarioOutcome,
    pub steps: usize,
    pub frames_sent: u64,
    pub block_ratio: f64,
    pub duration_ms: i64,
}

impl ScenarioComparison {
    pub fn new() -> Self {
        Self {
            scenarios: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn add_scenario(&mut self, report: &ScenarioReport) {
        let metrics = AttackMetrics::from_results(&report.results);

        self.scenarios.push(ScenarioSummary {
            name: report.scenario.clone(),
            outcome: report.outcome,
            steps: report.results.len(),
            frames_sent: report.total_frames_sent(),
            block_ratio: metrics.block_ratio,
            duration_ms: report.duration_ms(),
        });
    }

    pub fn generate_report(&self) -> String {
        let mut report = String::new();

        report.push('\n');
        report.push_str("╔══════════════════════════════════════════════════════════════╗\n");
        report.push_str("║           SCENARIO COMPARISON REPORT                         ║\n");
        report.push_str("╚══════════════════════════════════════════════════════════════╝\n");
        report.push('\n');

        report.push_str(&format!(
            "Report Generated: {}\n",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        report.push_str(&format!("Total Scenarios: {}\n\n", self.scenarios.len()));

        report.push_str("┌────────────────────────────┬──────────┬────────┬─────────┬──────────┐\n");
        report.push_str("│ Scenario Name              │ Outcome  │ Steps  │ Frames  │ Block %  │\n");
        report.push_str("├────────────────────────────┼──────────┼────────┼─────────┼──────────┤\n");

        for summary in &self.scenarios {
            let outcome = match summary.outcome {
                ScenarioOutcome::Completed => "complete",
                ScenarioOutcome::Stopped => "stopped",
                ScenarioOutcome::BudgetExceeded => "budget",
            };

            report.push_str(&format!(
                "│ {:26} │ {:8} │ {:6} │ {:7} │ {:7.1}% │\n",
                truncate_str(&summary.name, 26),
                outcome,
                summary.steps,
                summary.frames_sent,
                summary.block_ratio * 100.0
            ));
        }

        report.push_str("└────────────────────────────┴──────────┴────────┴─────────┴──────────┘\n");
        report.push('\n');

        report
    }
}

impl Default for ScenarioComparison {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
