/// Audit Log Module
///
/// Append-only record of every validation verdict and every detector
/// classification. Each record carries the hash of the previous one, so a
/// modified, removed or reordered record breaks the chain and is reported by
/// [`verify_log_file`].
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

/// Content of one audit event, before sequencing and chaining
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Emitting component ("safety", "monitor", "engine")
    pub component: String,

    /// Event kind, e.g. the attack kind of a verdict or "classification"
    pub kind: String,

    /// Raw CAN identifier the event refers to
    pub frame_id: Option<u32>,

    /// Frame payload as lowercase hex
    pub payload_hex: Option<String>,

    /// Verdict reason or detector classification
    pub outcome: String,

    /// Free-form context (spoof values, anomaly measurements)
    pub detail: Option<String>,
}

/// A single sequenced entry in the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LogEvent,
    /// Hash of the previous record (empty for the first record)
    pub prev_hash: String,
    pub entry_hash: String,
}

impl LogRecord {
    fn new(sequence: u64, event: LogEvent, prev_hash: String) -> Self {
        let timestamp = Utc::now();
        let entry_hash = compute_hash(sequence, &timestamp, &event, &prev_hash);

        Self {
            sequence,
            timestamp,
            event,
            prev_hash,
            entry_hash,
        }
    }

    /// Verify this record's own hash
    pub fn verify_hash(&self) -> bool {
        compute_hash(self.sequence, &self.timestamp, &self.event, &self.prev_hash)
            == self.entry_hash
    }

    /// Verify the link to the preceding record
    pub fn verify_chain(&self, prev: &LogRecord) -> bool {
        self.prev_hash == prev.entry_hash && self.sequence == prev.sequence + 1
    }
}

fn compute_hash(
    sequence: u64,
    timestamp: &DateTime<Utc>,
    event: &LogEvent,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(serde_json::to_string(event).unwrap_or_default().as_bytes());
    hasher.update(prev_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Sequence number and last hash, advanced together
#[derive(Default)]
struct ChainState {
    sequence: u64,
    last_hash: String,
}

impl ChainState {
    fn next(&mut self, event: LogEvent) -> LogRecord {
        let record = LogRecord::new(self.sequence, event, self.last_hash.clone());
        self.sequence += 1;
        self.last_hash = record.entry_hash.clone();
        record
    }
}

/// Destination for audit events
///
/// Appends never fail from the caller's point of view: a sink that cannot
/// write reports it through `tracing` and keeps going.
pub trait LogSink: Send + Sync {
    fn append(&self, event: LogEvent);

    /// Number of records appended so far
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSONL file sink (one chained record per line)
pub struct JsonlLogSink {
    path: PathBuf,
    inner: Mutex<JsonlInner>,
}

struct JsonlInner {
    chain: ChainState,
    writer: BufWriter<File>,
}

impl JsonlLogSink {
    /// Create `<dir>/<prefix>_<timestamp>.jsonl`, creating `dir` if needed
    pub fn create(dir: &Path, prefix: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        Self::open(dir.join(format!("{}_{}.jsonl", prefix, timestamp)))
    }

    /// Open (or create) a specific log file
    ///
    /// Appending to an existing file starts a new chain, which
    /// [`verify_log_file`] reports. Use a fresh file per run.
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            inner: Mutex::new(JsonlInner {
                chain: ChainState::default(),
                writer: BufWriter::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for JsonlLogSink {
    fn append(&self, event: LogEvent) {
        let mut inner = self.inner.lock();
        let record = inner.chain.next(event);

        let result = serde_json::to_string(&record)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                writeln!(inner.writer, "{}", json)?;
                inner.writer.flush()
            });

        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "audit log write failed");
        }
    }

    fn len(&self) -> u64 {
        self.inner.lock().chain.sequence
    }
}

impl fmt::Debug for JsonlLogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlLogSink")
            .field("path", &self.path)
            .field("records", &self.len())
            .finish()
    }
}

enum SinkCommand {
    Append(LogEvent),
    Flush(oneshot::Sender<()>),
}

/// Sink that hands events to a dedicated writer thread
///
/// `append` only enqueues, so attack tasks never wait on file I/O or on each
/// other's writes. Nothing is dropped: the queue is unbounded, and
/// [`BackgroundLogSink::flush`] waits until everything queued so far has
/// reached the inner sink.
pub struct BackgroundLogSink {
    tx: mpsc::UnboundedSender<SinkCommand>,
    queued: AtomicU64,
}

impl BackgroundLogSink {
    /// Start the writer; must be called inside a Tokio runtime
    pub fn spawn(inner: Arc<dyn LogSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::task::spawn_blocking(move || {
            while let Some(command) = rx.blocking_recv() {
                match command {
                    SinkCommand::Append(event) => inner.append(event),
                    SinkCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!(records = inner.len(), "audit writer finished");
        });

        Self {
            tx,
            queued: AtomicU64::new(0),
        }
    }

    /// Wait until every event appended before this call has been written
    pub async fn flush(&self) {
        let (done, written) = oneshot::channel();
        if self.tx.send(SinkCommand::Flush(done)).is_ok() {
            let _ = written.await;
        }
    }
}

impl LogSink for BackgroundLogSink {
    fn append(&self, event: LogEvent) {
        if self.tx.send(SinkCommand::Append(event)).is_err() {
            tracing::warn!("audit writer gone, event lost");
            return;
        }
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Events accepted so far, written or still queued
    fn len(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }
}

/// In-memory sink used by tests and dry runs
#[derive(Clone, Default)]
pub struct MemoryLogSink {
    inner: Arc<Mutex<(ChainState, Vec<LogRecord>)>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.inner.lock().1.clone()
    }

    /// Count records whose outcome equals `outcome`
    pub fn count_outcome(&self, outcome: &str) -> usize {
        self.inner
            .lock()
            .1
            .iter()
            .filter(|r| r.event.outcome == outcome)
            .count()
    }

    pub fn count_component(&self, component: &str) -> usize {
        self.inner
            .lock()
            .1
            .iter()
            .filter(|r| r.event.component == component)
            .count()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, event: LogEvent) {
        let mut inner = self.inner.lock();
        let record = inner.0.next(event);
        inner.1.push(record);
    }

    fn len(&self) -> u64 {
        self.inner.lock().0.sequence
    }
}

/// Result of log verification
#[derive(Debug)]
pub struct VerificationResult {
    pub total_entries: usize,
    pub verified: bool,
    pub issues: Vec<String>,
}

/// Verify integrity of an entire audit log file
pub fn verify_log_file(log_path: &Path) -> Result<VerificationResult, ConfigError> {
    let file = File::open(log_path).map_err(|e| ConfigError::Io {
        path: log_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut entries: Vec<LogRecord> = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| ConfigError::Io {
            path: log_path.to_path_buf(),
            reason: format!("line {}: {}", line_num + 1, e),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|e| ConfigError::Parse {
            path: log_path.to_path_buf(),
            reason: format!("line {}: {}", line_num + 1, e),
        })?;
        entries.push(entry);
    }

    let mut issues = Vec::new();

    if let Some(first) = entries.first()
        && !first.prev_hash.is_empty()
    {
        issues.push(format!(
            "Entry 0: first entry should have empty prev_hash, got '{}'",
            first.prev_hash
        ));
    }

    for (i, entry) in entries.iter().enumerate() {
        if !entry.verify_hash() {
            issues.push(format!("Entry {}: hash verification failed (tampered)", i));
        }
        if entry.sequence != i as u64 {
            issues.push(format!(
                "Entry {}: expected sequence {}, got {}",
                i, i, entry.sequence
            ));
        }
    }

    for (i, pair) in entries.windows(2).enumerate() {
        if !pair[1].verify_chain(&pair[0]) {
            issues.push(format!(
                "Entry {}: chain verification failed (missing or reordered entry)",
                i + 1
            ));
        }
    }

    Ok(VerificationResult {
        total_entries: entries.len(),
        verified: issues.is_empty(),
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn verdict(frame_id: u32, outcome: &str) -> LogEvent {
        LogEvent {
            component: "safety".to_string(),
            kind: "injection".to_string(),
            frame_id: Some(frame_id),
            payload_hex: Some("deadbeef".to_string()),
            outcome: outcome.to_string(),
            detail: None,
        }
    }

    #[test]
    fn test_record_chain_links() {
        let mut chain = ChainState::default();
        let first = chain.next(verdict(0x100, "allowed"));
        let second = chain.next(verdict(0x100, "rate_limited"));

        assert!(first.prev_hash.is_empty());
        assert!(first.verify_hash());
        assert!(second.verify_hash());
        assert!(second.verify_chain(&first));
        assert!(!first.verify_chain(&second));
    }

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemoryLogSink::new();
        sink.append(verdict(0x100, "allowed"));
        sink.append(verdict(0x002, "blocked_id"));
        sink.append(verdict(0x100, "allowed"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.count_outcome("allowed"), 2);
        assert_eq!(sink.count_outcome("blocked_id"), 1);
        assert_eq!(sink.count_component("safety"), 3);
        assert_eq!(sink.records()[2].sequence, 2);
    }

    #[tokio::test]
    async fn test_background_sink_writes_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let file = Arc::new(JsonlLogSink::create(temp_dir.path(), "audit").unwrap());
        let sink = BackgroundLogSink::spawn(file.clone());

        for id in 0..50u32 {
            sink.append(verdict(id, "allowed"));
        }
        assert_eq!(sink.len(), 50);

        sink.flush().await;
        assert_eq!(file.len(), 50);

        let result = verify_log_file(file.path()).unwrap();
        assert_eq!(result.total_entries, 50);
        assert!(result.verified, "{:?}", result.issues);

        let ids: Vec<u32> = fs::read_to_string(file.path())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<LogRecord>(line).unwrap())
            .filter_map(|record| record.event.frame_id)
            .collect();
        assert_eq!(ids, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_jsonl_log_verifies() {
        let temp_dir = TempDir::new().unwrap();
        let sink = JsonlLogSink::create(temp_dir.path(), "audit").expect("Failed to create sink");

        sink.append(verdict(0x100, "allowed"));
        sink.append(verdict(0x002, "blocked_id"));
        sink.append(verdict(0x100, "dry_run"));
        assert_eq!(sink.len(), 3);

        let result = verify_log_file(sink.path()).expect("Verification failed");
        assert_eq!(result.total_entries, 3);
        assert!(result.verified, "Log should verify: {:?}", result.issues);
    }

    #[test]
    fn test_tamper_detection() {
        let temp_dir = TempDir::new().unwrap();
        let sink = JsonlLogSink::create(temp_dir.path(), "audit").unwrap();

        sink.append(verdict(0x100, "allowed"));
        sink.append(verdict(0x002, "blocked_id"));

        let path = sink.path().to_path_buf();
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("blocked_id", "allowed")).unwrap();

        let result = verify_log_file(&path).unwrap();
        assert!(!result.verified, "Tampered log should not verify");
        assert!(!result.issues.is_empty());
    }

    #[test]
    fn test_removed_record_detected() {
        let temp_dir = TempDir::new().unwrap();
        let sink = JsonlLogSink::create(temp_dir.path(), "audit").unwrap();

        for _ in 0..3 {
            sink.append(verdict(0x100, "allowed"));
        }

        let path = sink.path().to_path_buf();
        let content = fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = content
            .lines()
            .enumerate()
            .filter(|(i, _)| *i != 1)
            .map(|(_, l)| l)
            .collect();
        fs::write(&path, kept.join("\n")).unwrap();

        let result = verify_log_file(&path).unwrap();
        assert!(!result.verified);
        assert_eq!(result.total_entries, 2);
    }

    #[test]
    fn test_missing_log_is_an_error() {
        let err = verify_log_file(Path::new("/nonexistent/audit.jsonl")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
