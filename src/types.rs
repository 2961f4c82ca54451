use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest 11-bit standard identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Largest 29-bit extended identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Classic CAN payload limit
pub const MAX_PAYLOAD_LEN: usize = 8;

/// CAN Frame identifier (11-bit standard or 29-bit extended)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CanId {
    Standard(u16), // 11-bit (0x000 - 0x7FF)
    Extended(u32), // 29-bit (0x00000000 - 0x1FFFFFFF)
}

impl CanId {
    /// Classify a raw identifier: anything up to 0x7FF is standard, up to
    /// 0x1FFFFFFF extended, everything else is rejected.
    pub fn from_raw(raw: u32) -> Result<Self, ConfigError> {
        if raw <= MAX_STANDARD_ID {
            Ok(CanId::Standard(raw as u16))
        } else if raw <= MAX_EXTENDED_ID {
            Ok(CanId::Extended(raw))
        } else {
            Err(ConfigError::InvalidCanId { id: raw })
        }
    }

    pub fn value(&self) -> u32 {
        match self {
            CanId::Standard(id) => *id as u32,
            CanId::Extended(id) => *id,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            CanId::Standard(id) => (*id as u32) <= MAX_STANDARD_ID,
            CanId::Extended(id) => *id <= MAX_EXTENDED_ID,
        }
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanId::Standard(id) => write!(f, "0x{:03X}", id),
            CanId::Extended(id) => write!(f, "0x{:08X}", id),
        }
    }
}

/// Well-known identifiers of the simulated vehicle network
pub mod can_ids {
    use super::CanId;

    // Safety-critical (denylisted by default)
    pub const ENGINE_CONTROL: CanId = CanId::Standard(0x000);
    pub const TRANSMISSION: CanId = CanId::Standard(0x001);
    pub const BRAKE_SYSTEM: CanId = CanId::Standard(0x002);
    pub const STEERING: CanId = CanId::Standard(0x003);

    // Powertrain sensors
    pub const SPEED_SENSOR: CanId = CanId::Standard(0x100);

    // Body / comfort
    pub const SAFETY_SYSTEMS: CanId = CanId::Standard(0x200);
    pub const BODY_CONTROL: CanId = CanId::Standard(0x300);
    pub const INFOTAINMENT: CanId = CanId::Standard(0x400);
    pub const TELEMATICS: CanId = CanId::Standard(0x500);
}

/// Whether a frame was produced by this process or observed on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDirection {
    Sent,
    Observed,
}

/// CAN Frame - standard CAN 2.0B format
///
/// Frames are built once and never mutated; re-observing a frame produces a
/// new value via [`CanFrame::observed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: CanId,
    pub data: Vec<u8>, // 0-8 bytes
    pub timestamp: DateTime<Utc>,
    pub source: String, // sender identifier
    pub direction: FrameDirection,
}

impl CanFrame {
    pub fn new(id: CanId, data: Vec<u8>, source: String) -> Self {
        Self {
            id,
            data,
            timestamp: Utc::now(),
            source,
            direction: FrameDirection::Sent,
        }
    }

    /// Build a frame with an explicit timestamp (synthetic streams, replays)
    pub fn with_timestamp(
        id: CanId,
        data: Vec<u8>,
        source: String,
        timestamp: DateTime<Utc>,
        direction: FrameDirection,
    ) -> Self {
        Self {
            id,
            data,
            timestamp,
            source,
            direction,
        }
    }

    /// Copy of this frame as seen by a passive observer. The bus timestamp
    /// is kept: it is the arrival time the detector works with.
    pub fn observed(&self) -> Self {
        Self {
            id: self.id,
            data: self.data.clone(),
            timestamp: self.timestamp,
            source: self.source.clone(),
            direction: FrameDirection::Observed,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.data.len() <= MAX_PAYLOAD_LEN && self.id.is_valid()
    }

    pub fn payload_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_id_classification() {
        assert_eq!(CanId::from_raw(0x100).unwrap(), CanId::Standard(0x100));
        assert_eq!(CanId::from_raw(0x7FF).unwrap(), CanId::Standard(0x7FF));
        assert_eq!(CanId::from_raw(0x800).unwrap(), CanId::Extended(0x800));
        assert_eq!(
            CanId::from_raw(0x1FFF_FFFF).unwrap(),
            CanId::Extended(0x1FFF_FFFF)
        );
        assert!(CanId::from_raw(0x2000_0000).is_err());
    }

    #[test]
    fn test_frame_validity() {
        let ok = CanFrame::new(CanId::Standard(0x100), vec![0; 8], "T".to_string());
        assert!(ok.is_valid());

        let too_long = CanFrame::new(CanId::Standard(0x100), vec![0; 9], "T".to_string());
        assert!(!too_long.is_valid());

        let bad_id = CanFrame::new(CanId::Standard(0x900), vec![], "T".to_string());
        assert!(!bad_id.is_valid());
    }

    #[test]
    fn test_observed_copy_keeps_content() {
        let frame = CanFrame::new(CanId::Standard(0x123), vec![0xDE, 0xAD], "ECU".to_string());
        let seen = frame.observed();
        assert_eq!(seen.id, frame.id);
        assert_eq!(seen.data, frame.data);
        assert_eq!(seen.timestamp, frame.timestamp);
        assert_eq!(seen.direction, FrameDirection::Observed);
        assert_eq!(frame.direction, FrameDirection::Sent);
        assert_eq!(seen.payload_hex(), "dead");
    }
}
