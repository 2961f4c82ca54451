/// Streaming Anomaly Detection
///
/// Keeps a small statistical profile per CAN ID and classifies every observed
/// frame against it. Profiles adapt as traffic drifts:
///
/// - Inter-arrival mean with an exponentially weighted update
/// - Dominant payload signature (most frequent payload seen)
/// - Last-seen time, so IDs silent for longer than the observation window
///   count as novel again
///
/// Classification is first-match-wins: novel ID, then rate anomaly, then
/// payload anomaly, otherwise nominal. The baseline is updated for every frame
/// regardless of its classification.
use crate::security_log::LogEvent;
use crate::types::CanFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Upper bound on distinct payload signatures remembered per ID
pub const MAX_SIGNATURES: usize = 32;

/// Detector tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// An ID silent for longer than this is reported as novel again
    pub observation_window_ms: u64,

    /// Interval below `rate_factor * mean_interval` is a rate anomaly
    pub rate_factor: f64,

    /// EWMA weight of the newest interval sample
    pub ewma_alpha: f64,

    /// Bit distance from the dominant signature above which a payload is anomalous
    pub hamming_threshold: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            observation_window_ms: 60_000,
            rate_factor: 0.1,
            ewma_alpha: 0.2,
            hamming_threshold: 3,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "monitor.detector.ewma_alpha",
                reason: format!("{} is outside (0, 1]", self.ewma_alpha),
            });
        }
        if !(self.rate_factor > 0.0 && self.rate_factor < 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "monitor.detector.rate_factor",
                reason: format!("{} is outside (0, 1)", self.rate_factor),
            });
        }
        if self.observation_window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "monitor.detector.observation_window_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// First sighting, or first after a silence longer than the window
    NovelId,
    /// Arrived much faster than the ID's running mean interval
    RateAnomaly,
    /// Payload far from the ID's dominant signature
    PayloadAnomaly,
    Nominal,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::NovelId => "novel_id",
            Classification::RateAnomaly => "rate_anomaly",
            Classification::PayloadAnomaly => "payload_anomaly",
            Classification::Nominal => "nominal",
        }
    }

    pub fn is_anomaly(&self) -> bool {
        !matches!(self, Classification::Nominal)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-ID profile
#[derive(Debug, Clone, Serialize)]
pub struct IdBaseline {
    /// EWMA of inter-arrival time; unset until the second frame
    pub mean_interval_ms: Option<f64>,

    pub observed_count: u64,

    pub last_seen: DateTime<Utc>,

    /// (payload, occurrences), bounded by [`MAX_SIGNATURES`]
    signatures: Vec<(Vec<u8>, u64)>,
}

impl IdBaseline {
    fn new(timestamp: DateTime<Utc>, payload: &[u8]) -> Self {
        Self {
            mean_interval_ms: None,
            observed_count: 1,
            last_seen: timestamp,
            signatures: vec![(payload.to_vec(), 1)],
        }
    }

    /// Most frequent payload; ties go to the lexicographically smaller one
    pub fn dominant_signature(&self) -> Option<&[u8]> {
        self.signatures
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(payload, _)| payload.as_slice())
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    fn record_signature(&mut self, payload: &[u8]) {
        if let Some(entry) = self.signatures.iter_mut().find(|(p, _)| p == payload) {
            entry.1 += 1;
            return;
        }

        if self.signatures.len() >= MAX_SIGNATURES
            && let Some(rarest) = self
                .signatures
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, count))| *count)
                .map(|(i, _)| i)
        {
            self.signatures.swap_remove(rarest);
        }
        self.signatures.push((payload.to_vec(), 1));
    }

    fn update_interval(&mut self, sample_ms: f64, alpha: f64) {
        self.mean_interval_ms = Some(match self.mean_interval_ms {
            None => sample_ms,
            Some(mean) => mean * (1.0 - alpha) + sample_ms * alpha,
        });
    }
}

/// Bit-level Hamming distance; bytes present in only one payload count 8 bits each
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    let common: u32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();
    let extra = a.len().abs_diff(b.len()) as u32 * 8;
    common + extra
}

/// One classified observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub timestamp: DateTime<Utc>,
    pub can_id: u32,
    pub payload_hex: String,
    pub classification: Classification,
    pub detail: Option<String>,
}

impl DetectionEvent {
    /// Audit record for this classification
    pub fn to_log_event(&self) -> LogEvent {
        LogEvent {
            component: "monitor".to_string(),
            kind: "classification".to_string(),
            frame_id: Some(self.can_id),
            payload_hex: Some(self.payload_hex.clone()),
            outcome: self.classification.as_str().to_string(),
            detail: self.detail.clone(),
        }
    }
}

/// Per-ID baseline detector
///
/// Owned by the monitor task alone; it is never shared with senders.
/// Baselines silent for longer than the observation window are dropped
/// at most once per window, so the map tracks only IDs still on the bus.
pub struct Detector {
    config: DetectorConfig,
    baselines: HashMap<u32, IdBaseline>,
    last_prune: Option<DateTime<Utc>>,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            baselines: HashMap::new(),
            last_prune: None,
        }
    }

    pub fn baseline(&self, can_id: u32) -> Option<&IdBaseline> {
        self.baselines.get(&can_id)
    }

    pub fn tracked_ids(&self) -> usize {
        self.baselines.len()
    }

    /// Classify a frame and fold it into its ID's baseline
    ///
    /// The frame timestamp is used as the arrival time.
    pub fn classify(&mut self, frame: &CanFrame) -> DetectionEvent {
        let can_id = frame.id.value();
        let now = frame.timestamp;
        let window_ms = self.config.observation_window_ms as f64;

        let (classification, detail) = match self.baselines.get_mut(&can_id) {
            None => {
                self.baselines
                    .insert(can_id, IdBaseline::new(now, &frame.data));
                (Classification::NovelId, Some("first observation".to_string()))
            }
            Some(baseline) => {
                let interval_ms = elapsed_ms(baseline.last_seen, now);

                if interval_ms > window_ms {
                    *baseline = IdBaseline::new(now, &frame.data);
                    (
                        Classification::NovelId,
                        Some(format!("silent for {:.0} ms", interval_ms)),
                    )
                } else {
                    let verdict = classify_against(baseline, &self.config, interval_ms, &frame.data);

                    baseline.update_interval(interval_ms, self.config.ewma_alpha);
                    baseline.record_signature(&frame.data);
                    baseline.observed_count += 1;
                    baseline.last_seen = now;
                    verdict
                }
            }
        };

        self.prune_silent(now, window_ms);

        DetectionEvent {
            timestamp: now,
            can_id,
            payload_hex: frame.payload_hex(),
            classification,
            detail,
        }
    }

    /// A pruned ID comes back as `NovelId`, exactly as an expired baseline would
    fn prune_silent(&mut self, now: DateTime<Utc>, window_ms: f64) {
        let Some(last_prune) = self.last_prune else {
            self.last_prune = Some(now);
            return;
        };
        if elapsed_ms(last_prune, now) < window_ms {
            return;
        }

        let before = self.baselines.len();
        self.baselines
            .retain(|_, baseline| elapsed_ms(baseline.last_seen, now) <= window_ms);
        self.last_prune = Some(now);

        let pruned = before - self.baselines.len();
        if pruned > 0 {
            tracing::debug!(pruned, tracked = self.baselines.len(), "pruned silent baselines");
        }
    }
}

/// Rate then payload check against the baseline as it stood before this frame
fn classify_against(
    baseline: &IdBaseline,
    config: &DetectorConfig,
    interval_ms: f64,
    payload: &[u8],
) -> (Classification, Option<String>) {
    if let Some(mean) = baseline.mean_interval_ms
        && interval_ms < config.rate_factor * mean
    {
        return (
            Classification::RateAnomaly,
            Some(format!("interval {:.1} ms vs mean {:.1} ms", interval_ms, mean)),
        );
    }

    if let Some(dominant) = baseline.dominant_signature() {
        let distance = hamming_distance(dominant, payload);
        if distance > config.hamming_threshold {
            return (
                Classification::PayloadAnomaly,
                Some(format!(
                    "hamming distance {} from dominant {}",
                    distance,
                    hex::encode(dominant)
                )),
            );
        }
    }

    (Classification::Nominal, None)
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => (us.max(0)) as f64 / 1000.0,
        None => delta.num_milliseconds().max(0) as f64,
    }
}
