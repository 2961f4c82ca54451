/// Replay Attack Support
///
/// Loads previously observed traffic and re-emits it with the original
/// inter-frame spacing divided by a speed factor. Two log formats are read:
///
/// - JSON lines `{"timestamp": 1700000000.25, "arbitration_id": 256, "data": "0a0b"}`
///   (the monitor's capture format)
/// - candump lines `(1700000000.250000) vcan0 100#0A0B`
use crate::attack_sim::{Pace, PlannedFrame};
use crate::error::ConfigError;
use crate::types::{CanFrame, CanId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One captured frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// Capture time in seconds (any epoch; only differences matter)
    pub timestamp: f64,
    pub arbitration_id: u32,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl ReplayEntry {
    pub fn from_frame(frame: &CanFrame) -> Self {
        Self {
            timestamp: frame.timestamp.timestamp_micros() as f64 / 1_000_000.0,
            arbitration_id: frame.id.value(),
            data: frame.data.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayFormat {
    /// Decide per line: `{` starts JSON, anything else is tried as candump
    #[default]
    Auto,
    Jsonl,
    Candump,
}

/// Where replayed frames come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaySource {
    File {
        path: PathBuf,
        #[serde(default)]
        format: ReplayFormat,
    },
    Frames(Vec<ReplayEntry>),
}

impl ReplaySource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ReplaySource::File {
            path: path.into(),
            format: ReplayFormat::Auto,
        }
    }

    /// Checks that do not touch the filesystem
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ReplaySource::File { path, .. } if path.as_os_str().is_empty() => {
                Err(ConfigError::InvalidValue {
                    field: "replay.source.path",
                    reason: "path is empty".to_string(),
                })
            }
            ReplaySource::Frames(entries) if entries.is_empty() => Err(ConfigError::EmptyReplayLog),
            ReplaySource::Frames(entries) if entries.iter().any(|e| !e.timestamp.is_finite()) => {
                Err(ConfigError::InvalidValue {
                    field: "replay.source.frames",
                    reason: "timestamps must be finite".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn load(&self) -> Result<Vec<ReplayEntry>, ConfigError> {
        match self {
            ReplaySource::File { path, format } => load_replay_log(path, *format),
            ReplaySource::Frames(entries) => {
                if entries.is_empty() {
                    return Err(ConfigError::EmptyReplayLog);
                }
                Ok(entries.clone())
            }
        }
    }
}

/// Read a capture file, skipping blank and unparseable lines
pub fn load_replay_log(path: &Path, format: ReplayFormat) -> Result<Vec<ReplayEntry>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReplayLog {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut entries = Vec::new();
    let mut skipped = 0usize;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match format {
            ReplayFormat::Jsonl => parse_json_line(line),
            ReplayFormat::Candump => parse_candump_line(line),
            ReplayFormat::Auto if line.starts_with('{') => parse_json_line(line),
            ReplayFormat::Auto => parse_candump_line(line),
        };

        match parsed {
            Some(entry) => entries.push(entry),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::debug!(path = %path.display(), skipped, "skipped unparseable replay lines");
    }

    if entries.is_empty() {
        return Err(ConfigError::ReplayLog {
            path: path.to_path_buf(),
            reason: "contains no replayable frames".to_string(),
        });
    }

    Ok(entries)
}

fn parse_json_line(line: &str) -> Option<ReplayEntry> {
    let entry: ReplayEntry = serde_json::from_str(line).ok()?;
    (entry.timestamp.is_finite() && CanId::from_raw(entry.arbitration_id).is_ok()).then_some(entry)
}

/// `(<ts>) <iface> <ID>#<HEX>`; remote and CAN FD frames are skipped
fn parse_candump_line(line: &str) -> Option<ReplayEntry> {
    let rest = line.strip_prefix('(')?;
    let (ts, rest) = rest.split_once(')')?;
    let timestamp: f64 = ts.trim().parse().ok()?;
    if !timestamp.is_finite() {
        return None;
    }

    let mut fields = rest.split_whitespace();
    let _iface = fields.next()?;
    let frame = fields.next()?;

    if frame.contains("##") {
        return None;
    }
    let (id, data) = frame.split_once('#')?;
    if data.starts_with('R') {
        return None;
    }

    let arbitration_id = u32::from_str_radix(id, 16).ok()?;
    CanId::from_raw(arbitration_id).ok()?;
    let data = hex::decode(data.replace('.', "")).ok()?;

    Some(ReplayEntry {
        timestamp,
        arbitration_id,
        data,
    })
}

/// Frame schedule for a replay attack
///
/// The i-th frame is due at `(ts_i - ts_0) / speed` after the start, so the
/// sender never accumulates drift from its own send latency. A timestamp
/// that goes backwards is clamped to the previous offset to keep file order.
#[derive(Debug, Clone)]
pub struct ReplaySchedule {
    entries: Vec<ReplayEntry>,
    speed: f64,
    index: usize,
    last_offset: Duration,
}

impl ReplaySchedule {
    pub fn new(
        entries: Vec<ReplayEntry>,
        speed: f64,
        id_filter: &[u32],
    ) -> Result<Self, ConfigError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(ConfigError::InvalidSpeed { speed });
        }

        let entries: Vec<ReplayEntry> = if id_filter.is_empty() {
            entries
        } else {
            entries
                .into_iter()
                .filter(|e| id_filter.contains(&e.arbitration_id))
                .collect()
        };

        if entries.is_empty() {
            return Err(ConfigError::EmptyReplayLog);
        }

        Ok(Self {
            entries,
            speed,
            index: 0,
            last_offset: Duration::ZERO,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_frame(&mut self) -> Option<PlannedFrame> {
        let entry = self.entries.get(self.index)?;
        self.index += 1;

        let t0 = self.entries[0].timestamp;
        let scaled = ((entry.timestamp - t0) / self.speed).max(0.0);

        // An offset past what Duration can hold is past any attack duration too
        let Ok(offset) = Duration::try_from_secs_f64(scaled) else {
            tracing::debug!(scaled, "replay offset out of range; ending schedule");
            self.index = self.entries.len();
            return None;
        };
        let offset = offset.max(self.last_offset);
        self.last_offset = offset;

        // Out-of-range inline IDs become invalid frames for the safety gate to reject
        let can_id = CanId::from_raw(entry.arbitration_id)
            .unwrap_or(CanId::Extended(entry.arbitration_id));

        Some(PlannedFrame {
            can_id,
            data: entry.data.clone(),
            pace: Pace::At(offset),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn entry(timestamp: f64, id: u32, data: &[u8]) -> ReplayEntry {
        ReplayEntry {
            timestamp,
            arbitration_id: id,
            data: data.to_vec(),
        }
    }

    fn offsets(schedule: &mut ReplaySchedule) -> Vec<Duration> {
        std::iter::from_fn(|| schedule.next_frame())
            .map(|f| match f.pace {
                Pace::At(d) => d,
                Pace::Immediate => panic!("replay frames are always scheduled"),
            })
            .collect()
    }

    #[test]
    fn test_speed_scales_deltas() {
        let entries = vec![
            entry(10.0, 0x100, &[1]),
            entry(11.0, 0x100, &[2]),
            entry(11.5, 0x100, &[3]),
            entry(13.5, 0x100, &[4]),
        ];
        let mut schedule = ReplaySchedule::new(entries, 2.0, &[]).unwrap();

        assert_eq!(
            offsets(&mut schedule),
            vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_millis(750),
                Duration::from_millis(1750),
            ]
        );
    }

    #[test]
    fn test_backwards_timestamp_keeps_order() {
        let entries = vec![
            entry(5.0, 0x100, &[1]),
            entry(6.0, 0x100, &[2]),
            entry(5.5, 0x100, &[3]),
        ];
        let mut schedule = ReplaySchedule::new(entries, 1.0, &[]).unwrap();
        let offsets = offsets(&mut schedule);
        assert_eq!(offsets[2], offsets[1]);
    }

    #[test]
    fn test_id_filter() {
        let entries = vec![
            entry(0.0, 0x100, &[1]),
            entry(0.1, 0x300, &[2]),
            entry(0.2, 0x200, &[3]),
        ];
        let mut schedule = ReplaySchedule::new(entries.clone(), 1.0, &[0x100, 0x200]).unwrap();
        assert_eq!(schedule.len(), 2);
        let ids: Vec<u32> = std::iter::from_fn(|| schedule.next_frame())
            .map(|f| f.can_id.value())
            .collect();
        assert_eq!(ids, vec![0x100, 0x200]);

        assert_eq!(
            ReplaySchedule::new(entries, 1.0, &[0x7FF]).unwrap_err(),
            ConfigError::EmptyReplayLog
        );
    }

    #[test]
    fn test_parse_candump() {
        let e = parse_candump_line("(1436509052.249713) vcan0 044#2A366C2BBA").unwrap();
        assert_eq!(e.arbitration_id, 0x044);
        assert_eq!(e.data, vec![0x2A, 0x36, 0x6C, 0x2B, 0xBA]);
        assert!((e.timestamp - 1436509052.249713).abs() < 1e-6);

        let ext = parse_candump_line("(1.0) can0 18DAF110#0210").unwrap();
        assert_eq!(ext.arbitration_id, 0x18DA_F110);

        let empty = parse_candump_line("(2.0) vcan0 123#").unwrap();
        assert!(empty.data.is_empty());

        assert!(parse_candump_line("(1.0) vcan0 123#R").is_none());
        assert!(parse_candump_line("garbage").is_none());
        assert!(parse_candump_line("(inf) vcan0 123#01").is_none());
        assert!(parse_candump_line("(NaN) vcan0 123#01").is_none());
    }

    #[test]
    fn test_tiny_speed_ends_schedule_instead_of_overflowing() {
        let entries = vec![
            entry(0.0, 0x100, &[1]),
            entry(1.0, 0x100, &[2]),
            entry(2.0, 0x100, &[3]),
        ];
        let mut schedule = ReplaySchedule::new(entries, 1e-20, &[]).unwrap();

        let first = schedule.next_frame().unwrap();
        assert_eq!(first.pace, Pace::At(Duration::ZERO));
        assert!(schedule.next_frame().is_none());
        assert!(schedule.next_frame().is_none());
    }

    #[test]
    fn test_infinite_timestamps_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "(1.0) vcan0 100#01").unwrap();
        writeln!(file, "(inf) vcan0 100#02").unwrap();
        writeln!(file, "(2.0) vcan0 100#03").unwrap();

        let entries = load_replay_log(file.path(), ReplayFormat::Candump).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.timestamp.is_finite()));

        let inline = ReplaySource::Frames(vec![entry(0.0, 0x100, &[1]), entry(f64::INFINITY, 0x100, &[2])]);
        assert!(matches!(
            inline.validate(),
            Err(ConfigError::InvalidValue { field: "replay.source.frames", .. })
        ));
    }

    #[test]
    fn test_load_mixed_log_skips_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"timestamp": 1.0, "arbitration_id": 256, "data": "0a"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not a frame").unwrap();
        writeln!(file, "(1.5) vcan0 200#0B0C").unwrap();

        let entries = load_replay_log(file.path(), ReplayFormat::Auto).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].arbitration_id, 0x100);
        assert_eq!(entries[1].data, vec![0x0B, 0x0C]);
    }

    #[test]
    fn test_empty_or_missing_log_is_config_error() {
        let file = NamedTempFile::new().unwrap();
        assert!(matches!(
            load_replay_log(file.path(), ReplayFormat::Jsonl),
            Err(ConfigError::ReplayLog { .. })
        ));
        assert!(matches!(
            ReplaySource::file("/nonexistent/capture.jsonl").load(),
            Err(ConfigError::ReplayLog { .. })
        ));
        assert_eq!(
            ReplaySource::Frames(vec![]).validate(),
            Err(ConfigError::EmptyReplayLog)
        );
    }
}
