/// Injection Frame Generators
///
/// 1. Basic injection - fixed frame at a fixed interval
/// 2. Spoofing - single-byte value claimed on a legitimate ID
/// 3. Flooding - fixed frame, no cadence (paced by the rate limiter only)
///
/// On the wire a spoofed frame is indistinguishable from an injected one;
/// the difference only shows up in the audit log.
use crate::attack_sim::{Pace, PlannedFrame};
use crate::types::CanId;
use std::time::Duration;

/// Same frame every `interval`, first one at the start
#[derive(Debug, Clone)]
pub struct FixedGenerator {
    can_id: CanId,
    data: Vec<u8>,
    interval: Duration,
    tick: u32,
}

impl FixedGenerator {
    pub fn new(can_id: CanId, data: Vec<u8>, interval: Duration) -> Self {
        Self {
            can_id,
            data,
            interval,
            tick: 0,
        }
    }

    /// Spoofed reading: the payload is the spoof value alone
    pub fn spoof(can_id: CanId, spoof_value: u8, interval: Duration) -> Self {
        Self::new(can_id, vec![spoof_value], interval)
    }

    pub fn next_frame(&mut self) -> PlannedFrame {
        let at = self.interval.saturating_mul(self.tick);
        self.tick = self.tick.saturating_add(1);

        PlannedFrame {
            can_id: self.can_id,
            data: self.data.clone(),
            pace: Pace::At(at),
        }
    }
}

/// Flooding attack (DoS) - unbounded stream of one frame
#[derive(Debug, Clone)]
pub struct FloodGenerator {
    can_id: CanId,
    data: Vec<u8>,
}

impl FloodGenerator {
    pub fn new(can_id: CanId, data: Vec<u8>) -> Self {
        Self { can_id, data }
    }

    pub fn next_frame(&mut self) -> PlannedFrame {
        PlannedFrame {
            can_id: self.can_id,
            data: self.data.clone(),
            pace: Pace::Immediate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_cadence() {
        let mut generator = FixedGenerator::new(
            CanId::Standard(0x100),
            vec![0xDE, 0xAD],
            Duration::from_millis(100),
        );

        let frames: Vec<PlannedFrame> = (0..3).map(|_| generator.next_frame()).collect();
        assert_eq!(frames[0].pace, Pace::At(Duration::ZERO));
        assert_eq!(frames[1].pace, Pace::At(Duration::from_millis(100)));
        assert_eq!(frames[2].pace, Pace::At(Duration::from_millis(200)));
        assert!(frames.iter().all(|f| f.data == vec![0xDE, 0xAD]));
    }

    #[test]
    fn test_spoof_payload_is_the_spoof_value() {
        let mut generator =
            FixedGenerator::spoof(CanId::Standard(0x200), 255, Duration::from_millis(50));
        let frame = generator.next_frame();
        assert_eq!(frame.can_id, CanId::Standard(0x200));
        assert_eq!(frame.data, vec![255]);
    }

    #[test]
    fn test_flood_is_unpaced() {
        let mut generator = FloodGenerator::new(CanId::Standard(0x100), vec![0xFF]);
        for _ in 0..5 {
            assert_eq!(generator.next_frame().pace, Pace::Immediate);
        }
    }
}
