/// Passive Bus Monitor
///
/// Consumes every frame on a channel through its own receiver, classifies it
/// with a [`Detector`] and hands the result to a bounded queue. A second task
/// drains the queue into the audit sink (and an optional capture file), so a
/// slow sink can never stall frame consumption. When the queue is full the
/// oldest record is dropped and counted.
use crate::anomaly_detection::{Classification, DetectionEvent, Detector, DetectorConfig};
use crate::attack_sim::{ReplayEntry, StopToken};
use crate::can_bus::BusTransport;
use crate::error::TransportError;
use crate::security_log::LogSink;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub detector: DetectorConfig,

    /// Records buffered between detection and the sink
    pub queue_capacity: usize,

    /// Append every observed frame here in the replay JSONL format
    pub capture_path: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            queue_capacity: 1024,
            capture_path: None,
        }
    }
}

/// Bounded FIFO that drops its oldest item instead of blocking the producer
pub struct EventQueue<T> {
    inner: Mutex<QueueInner<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without waiting; returns false if an older item was evicted
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                true
            } else {
                false
            };
            inner.items.push_back(item);
            evicted
        };

        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        !evicted
    }

    /// Next item; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark the end of the stream; queued items are still delivered
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Work item for the sink task
enum MonitorRecord {
    Event(DetectionEvent),
    Capture(ReplayEntry),
}

/// Capture file in the replay JSONL format
pub struct CaptureWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CaptureWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, entry: &ReplayEntry) {
        let result = serde_json::to_string(entry)
            .map_err(std::io::Error::from)
            .and_then(|json| writeln!(self.writer, "{}", json));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "capture write failed");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(path = %self.path.display(), error = %e, "capture flush failed");
        }
    }
}

#[derive(Default)]
struct Counters {
    observed: AtomicU64,
    novel_id: AtomicU64,
    rate_anomaly: AtomicU64,
    payload_anomaly: AtomicU64,
    nominal: AtomicU64,
    receiver_skipped: AtomicU64,
    tracked_ids: AtomicU64,
}

impl Counters {
    fn record(&self, classification: Classification) {
        let counter = match classification {
            Classification::NovelId => &self.novel_id,
            Classification::RateAnomaly => &self.rate_anomaly,
            Classification::PayloadAnomaly => &self.payload_anomaly,
            Classification::Nominal => &self.nominal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Monitor statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub frames_observed: u64,
    pub novel_id: u64,
    pub rate_anomaly: u64,
    pub payload_anomaly: u64,
    pub nominal: u64,

    /// Records evicted from the sink queue under overload
    pub events_dropped: u64,

    /// Frames the transport receiver missed
    pub receiver_skipped: u64,

    pub tracked_ids: u64,
}

impl MonitorStats {
    pub fn anomalies(&self) -> u64 {
        self.novel_id + self.rate_anomaly + self.payload_anomaly
    }
}

/// Monitor builder
pub struct Monitor {
    config: MonitorConfig,
    sink: Arc<dyn LogSink>,
    capture: Option<CaptureWriter>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            config,
            sink,
            capture: None,
        }
    }

    /// Also write observed frames to a capture file
    pub fn with_capture(mut self, capture: CaptureWriter) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Open a receiver on `transport` and start the detection and sink tasks
    ///
    /// Frames sent after this returns are observed. The monitor runs until
    /// `stop` fires, the transport closes, or the handle is shut down.
    pub async fn spawn(
        self,
        transport: &dyn BusTransport,
        stop: &StopToken,
    ) -> Result<MonitorHandle, TransportError> {
        let mut receiver = transport.open_receiver().await?;
        let channel = transport.channel_name().to_string();

        let Monitor {
            config,
            sink,
            mut capture,
        } = self;

        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        let counters = Arc::new(Counters::default());
        let stop = stop.child();
        let capturing = capture.is_some();

        info!(
            channel = %channel,
            queue_capacity = config.queue_capacity,
            capture = capturing,
            "monitor started"
        );

        let detect = {
            let queue = Arc::clone(&queue);
            let counters = Arc::clone(&counters);
            let stop = stop.clone();
            let mut detector = Detector::new(config.detector.clone());

            tokio::spawn(async move {
                loop {
                    let received = tokio::select! {
                        biased;
                        _ = stop.stopped() => break,
                        received = receiver.receive() => received,
                    };

                    let frame = match received {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "monitor receiver closed");
                            break;
                        }
                    };

                    let event = detector.classify(&frame);
                    counters.observed.fetch_add(1, Ordering::Relaxed);
                    counters.record(event.classification);
                    counters
                        .receiver_skipped
                        .store(receiver.skipped(), Ordering::Relaxed);
                    counters
                        .tracked_ids
                        .store(detector.tracked_ids() as u64, Ordering::Relaxed);

                    if event.classification.is_anomaly() {
                        debug!(
                            can_id = format_args!("0x{:03X}", event.can_id),
                            classification = %event.classification,
                            detail = event.detail.as_deref().unwrap_or(""),
                            "anomaly"
                        );
                    }

                    if capturing {
                        queue.push(MonitorRecord::Capture(ReplayEntry::from_frame(&frame)));
                    }
                    queue.push(MonitorRecord::Event(event));
                }
                queue.close();
            })
        };

        let drain = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(record) = queue.pop().await {
                    match record {
                        MonitorRecord::Event(event) => sink.append(event.to_log_event()),
                        MonitorRecord::Capture(entry) => {
                            if let Some(capture) = capture.as_mut() {
                                capture.write(&entry);
                            }
                        }
                    }
                }
                if let Some(capture) = capture.as_mut() {
                    capture.flush();
                }
            })
        };

        Ok(MonitorHandle {
            stop,
            queue,
            counters,
            detect,
            drain,
        })
    }
}

/// Handle to a running monitor
pub struct MonitorHandle {
    stop: StopToken,
    queue: Arc<EventQueue<MonitorRecord>>,
    counters: Arc<Counters>,
    detect: JoinHandle<()>,
    drain: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stats(&self) -> MonitorStats {
        snapshot(&self.counters, &self.queue)
    }

    /// Records waiting for the sink
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_finished(&self) -> bool {
        self.detect.is_finished() && self.drain.is_finished()
    }

    /// Stop detection, flush everything already queued, and return final stats
    pub async fn shutdown(self) -> MonitorStats {
        let MonitorHandle {
            stop,
            queue,
            counters,
            detect,
            drain,
        } = self;

        stop.stop();
        if let Err(e) = detect.await {
            warn!(error = %e, "monitor detection task failed");
            queue.close();
        }
        if let Err(e) = drain.await {
            warn!(error = %e, "monitor sink task failed");
        }

        let stats = snapshot(&counters, &queue);
        info!(
            observed = stats.frames_observed,
            anomalies = stats.anomalies(),
            dropped = stats.events_dropped,
            "monitor stopped"
        );
        stats
    }
}

fn snapshot(c: &Counters, queue: &EventQueue<MonitorRecord>) -> MonitorStats {
    MonitorStats {
        frames_observed: c.observed.load(Ordering::Relaxed),
        novel_id: c.novel_id.load(Ordering::Relaxed),
        rate_anomaly: c.rate_anomaly.load(Ordering::Relaxed),
        payload_anomaly: c.payload_anomaly.load(Ordering::Relaxed),
        nominal: c.nominal.load(Ordering::Relaxed),
        events_dropped: queue.dropped(),
        receiver_skipped: c.receiver_skipped.load(Ordering::Relaxed),
        tracked_ids: c.tracked_ids.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can_bus::VirtualCanBus;
    use crate::security_log::MemoryLogSink;
    use crate::types::{CanFrame, CanId};
    use std::time::Duration;

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let queue = EventQueue::new(3);
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
    }

    #[tokio::test]
    async fn test_queue_delivers_remaining_items_after_close() {
        let queue = EventQueue::new(3);
        for i in 0..5 {
            queue.push(i);
        }
        queue.close();

        let mut drained = Vec::new();
        while let Some(item) = queue.pop().await {
            drained.push(item);
        }
        assert_eq!(drained, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_queue_pop_waits_for_push() {
        let queue = Arc::new(EventQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.push("frame");
        assert_eq!(consumer.await.unwrap(), Some("frame"));
    }

    #[tokio::test]
    async fn test_monitor_logs_every_frame() {
        let bus = VirtualCanBus::new("vcan0", 64);
        let sink = MemoryLogSink::new();
        let stop = StopToken::new();

        let handle = Monitor::new(MonitorConfig::default(), Arc::new(sink.clone()))
            .spawn(&bus, &stop)
            .await
            .unwrap();

        for id in [0x100u16, 0x100, 0x200] {
            bus.send(CanFrame::new(CanId::Standard(id), vec![1], "ECU".to_string()))
                .await
                .unwrap();
        }

        while handle.stats().frames_observed < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let stats = handle.shutdown().await;
        assert_eq!(stats.frames_observed, 3);
        assert_eq!(stats.novel_id, 2);
        assert_eq!(stats.tracked_ids, 2);
        assert_eq!(stats.events_dropped, 0);
        assert_eq!(sink.count_component("monitor"), 3);
        assert_eq!(sink.count_outcome("novel_id"), 2);
    }

    #[tokio::test]
    async fn test_parent_stop_ends_monitor() {
        let bus = VirtualCanBus::new("vcan0", 16);
        let stop = StopToken::new();
        let handle = Monitor::new(MonitorConfig::default(), Arc::new(MemoryLogSink::new()))
            .spawn(&bus, &stop)
            .await
            .unwrap();

        stop.stop();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }
}
