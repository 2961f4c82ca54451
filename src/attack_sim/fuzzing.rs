/// Fuzzing Frame Generator
///
/// Random payloads (and optionally random target IDs) drawn from a seeded
/// generator, so a run is reproducible from its seed.
use crate::attack_sim::{Pace, PlannedFrame};
use crate::types::CanId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

pub struct FuzzGenerator {
    rng: StdRng,
    targets: Vec<CanId>,
    interval: Duration,
    min_len: usize,
    max_len: usize,
    tick: u32,
}

impl FuzzGenerator {
    /// `targets` must be non-empty and `min_len <= max_len <= 8`; both are
    /// checked by static attack validation.
    pub fn new(
        targets: Vec<CanId>,
        seed: u64,
        interval: Duration,
        min_len: usize,
        max_len: usize,
    ) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            targets,
            interval,
            min_len,
            max_len,
            tick: 0,
        }
    }

    pub fn next_frame(&mut self) -> Option<PlannedFrame> {
        let can_id = match self.targets.len() {
            0 => return None,
            1 => self.targets[0],
            n => self.targets[self.rng.gen_range(0..n)],
        };

        let len = self.rng.gen_range(self.min_len..=self.max_len);
        let mut data = vec![0u8; len];
        self.rng.fill(data.as_mut_slice());

        let at = self.interval.saturating_mul(self.tick);
        self.tick = self.tick.saturating_add(1);

        Some(PlannedFrame {
            can_id,
            data,
            pace: Pace::At(at),
        })
    }
}
