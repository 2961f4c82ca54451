/// Lateral Movement Frame Generator
///
/// Walks an ordered list of ECUs to model progressive compromise across
/// network segments.
use crate::attack_sim::{Pace, PlannedFrame};
use crate::types::CanId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateralPattern {
    /// Stay on each target for a strictly growing dwell (`base * (k + 1)`
    /// for the k-th stint), sending every `interval`, with a payload value
    /// that rises per stint
    Escalate,
    /// Every tick sends one frame to each target, in list order
    Simultaneous,
    /// One frame per tick, cycling through targets
    Sequential,
}

/// Payload value for the k-th escalation step
pub fn escalation_value(k: u64) -> u8 {
    (50 + 20 * k).min(255) as u8
}

pub struct LateralGenerator {
    targets: Vec<CanId>,
    pattern: LateralPattern,
    base_dwell: Duration,
    interval: Duration,
    // escalate: current stint, frame within stint, start of stint
    stint: u64,
    frame_in_stint: u32,
    stint_start: Duration,
    // simultaneous / sequential
    tick: u32,
    slot: usize,
}

impl LateralGenerator {
    pub fn new(
        targets: Vec<CanId>,
        pattern: LateralPattern,
        base_dwell: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            targets,
            pattern,
            base_dwell,
            interval,
            stint: 0,
            frame_in_stint: 0,
            stint_start: Duration::ZERO,
            tick: 0,
            slot: 0,
        }
    }

    /// Dwell time of the k-th escalation stint
    pub fn dwell_for(&self, stint: u64) -> Duration {
        self.base_dwell
            .saturating_mul(u32::try_from(stint + 1).unwrap_or(u32::MAX))
    }

    pub fn next_frame(&mut self) -> Option<PlannedFrame> {
        if self.targets.is_empty() {
            return None;
        }
        Some(match self.pattern {
            LateralPattern::Escalate => self.next_escalate(),
            LateralPattern::Simultaneous => self.next_simultaneous(),
            LateralPattern::Sequential => self.next_sequential(),
        })
    }

    fn next_escalate(&mut self) -> PlannedFrame {
        loop {
            let dwell = self.dwell_for(self.stint);
            let offset = self.interval.saturating_mul(self.frame_in_stint);

            if self.frame_in_stint > 0 && offset >= dwell {
                self.stint_start = self.stint_start.saturating_add(dwell);
                self.stint += 1;
                self.frame_in_stint = 0;
                continue;
            }

            self.frame_in_stint += 1;
            let target = self.targets[(self.stint % self.targets.len() as u64) as usize];

            return PlannedFrame {
                can_id: target,
                data: vec![escalation_value(self.stint)],
                pace: Pace::At(self.stint_start.saturating_add(offset)),
            };
        }
    }

    fn next_simultaneous(&mut self) -> PlannedFrame {
        let index = self.slot;
        let frame = PlannedFrame {
            can_id: self.targets[index],
            data: vec![escalation_value(index as u64)],
            pace: Pace::At(self.interval.saturating_mul(self.tick)),
        };

        self.slot += 1;
        if self.slot == self.targets.len() {
            self.slot = 0;
            self.tick = self.tick.saturating_add(1);
        }
        frame
    }

    fn next_sequential(&mut self) -> PlannedFrame {
        let index = self.tick as usize % self.targets.len();
        let frame = PlannedFrame {
            can_id: self.targets[index],
            data: vec![(index * 10).min(255) as u8],
            pace: Pace::At(self.interval.saturating_mul(self.tick)),
        };
        self.tick = self.tick.saturating_add(1);
        frame
    }
}
