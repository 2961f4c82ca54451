/// Bus Monitor Integration Tests
///
/// The monitor attached to a virtual bus:
/// - Rate change detection on a synthetic stream
/// - Drop-oldest behavior behind a stalled sink
/// - Capture files feeding the replay attack
/// - Observation alongside a running attack
/// - Stalled log writers behind a running attack
use can_hydra::attack_sim::replay::{ReplayFormat, load_replay_log};
use can_hydra::monitor::CaptureWriter;
use can_hydra::types::FrameDirection;
use can_hydra::{
    AttackConfig, AttackEngine, AttackKind, AttackOutcome, BackgroundLogSink, BusTransport,
    CanFrame, CanId, LogEvent, LogSink, MemoryLogSink, Monitor, MonitorConfig, MonitorHandle, RateLimiter,
    ReplaySource, SafetyLimits, SafetyValidator, StopToken, VirtualCanBus,
};
use chrono::{TimeZone, Utc};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Wait (up to ten seconds of runtime time) until the monitor has seen `count` frames
async fn wait_for_observed(handle: &MonitorHandle, count: u64) {
    for _ in 0..10_000 {
        if handle.stats().frames_observed >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!(
        "monitor observed {} of {} frames",
        handle.stats().frames_observed,
        count
    );
}

fn engine_on(bus: &VirtualCanBus, sink: &MemoryLogSink) -> AttackEngine {
    let validator = Arc::new(SafetyValidator::new(
        SafetyLimits::default(),
        RateLimiter::per_second(1000),
        Arc::new(sink.clone()),
    ));
    AttackEngine::new(Arc::new(bus.clone()), validator)
}

#[tokio::test]
async fn test_rate_change_flagged_after_slow_baseline() {
    let bus = VirtualCanBus::new("vcan0", 256);
    let sink = MemoryLogSink::new();
    let stop = StopToken::new();
    let handle = Monitor::new(MonitorConfig::default(), Arc::new(sink.clone()))
        .spawn(&bus, &stop)
        .await
        .unwrap();

    let id = CanId::from_raw(0x100).unwrap();
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let mut offsets_ms: Vec<i64> = (0..11).map(|i| i * 1000).collect();
    offsets_ms.extend((1..=40).map(|i| 10_000 + i * 50));

    for offset in &offsets_ms {
        let frame = CanFrame::with_timestamp(
            id,
            vec![0x00, 0x32],
            "ECU_SPEED".to_string(),
            base + chrono::Duration::milliseconds(*offset),
            FrameDirection::Sent,
        );
        bus.send(frame).await.unwrap();
    }

    wait_for_observed(&handle, offsets_ms.len() as u64).await;
    let stats = handle.shutdown().await;

    let outcomes: Vec<String> = sink.records().into_iter().map(|r| r.event.outcome).collect();
    assert_eq!(outcomes.len(), 51);
    assert_eq!(outcomes[0], "novel_id");
    assert!(outcomes[..11].iter().all(|o| o != "rate_anomaly"));
    assert_eq!(outcomes[11], "rate_anomaly");
    assert!(outcomes[11..].iter().any(|o| o == "rate_anomaly"));

    assert_eq!(stats.frames_observed, 51);
    assert_eq!(stats.novel_id, 1);
    assert!(stats.rate_anomaly >= 1);
    assert_eq!(stats.payload_anomaly, 0);
    assert_eq!(stats.events_dropped, 0);
}

/// Sink that blocks every append until the gate opens
#[derive(Clone, Default)]
struct GatedSink {
    gate: Arc<(Mutex<bool>, Condvar)>,
    inner: MemoryLogSink,
}

impl GatedSink {
    fn open(&self) {
        let (open, cvar) = &*self.gate;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }
}

impl LogSink for GatedSink {
    fn append(&self, event: LogEvent) {
        // Hand the worker's other tasks off while this one blocks
        tokio::task::block_in_place(|| {
            let (open, cvar) = &*self.gate;
            let mut is_open = open.lock().unwrap();
            while !*is_open {
                is_open = cvar.wait(is_open).unwrap();
            }
        });
        self.inner.append(event);
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_sink_drops_oldest_without_blocking_detection() {
    let bus = VirtualCanBus::new("vcan0", 256);
    let sink = GatedSink::default();
    let config = MonitorConfig {
        queue_capacity: 4,
        ..MonitorConfig::default()
    };
    let handle = Monitor::new(config, Arc::new(sink.clone()))
        .spawn(&bus, &StopToken::new())
        .await
        .unwrap();

    let id = CanId::from_raw(0x200).unwrap();
    for i in 0..100u8 {
        bus.send(CanFrame::new(id, vec![i], "ECU_BODY".to_string()))
            .await
            .unwrap();
    }

    // Detection keeps up even though the sink accepts nothing
    wait_for_observed(&handle, 100).await;
    let stats = handle.stats();
    assert!(stats.events_dropped > 0);
    assert!(handle.pending() <= 4);

    sink.open();
    let stats = handle.shutdown().await;

    assert_eq!(stats.frames_observed, 100);
    assert_eq!(sink.len() + stats.events_dropped, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_log_writers_do_not_slow_attacks() {
    let bus = VirtualCanBus::new("vcan0", 1024);
    let stop = StopToken::new();

    let monitor_file = GatedSink::default();
    let config = MonitorConfig {
        queue_capacity: 8,
        ..MonitorConfig::default()
    };
    let handle = Monitor::new(config, Arc::new(monitor_file.clone()))
        .spawn(&bus, &stop)
        .await
        .unwrap();

    let audit_file = GatedSink::default();
    let audit = Arc::new(BackgroundLogSink::spawn(Arc::new(audit_file.clone())));
    let validator = Arc::new(SafetyValidator::new(
        SafetyLimits::default(),
        RateLimiter::per_second(1000),
        audit.clone(),
    ));
    let engine = AttackEngine::new(Arc::new(bus.clone()), validator);

    let attack = AttackConfig::new(
        AttackKind::Injection {
            target_id: 0x100,
            payload: vec![0x01],
            interval_ms: 50,
        },
        Duration::from_millis(500),
    );

    let started = std::time::Instant::now();
    let result = engine.run(&attack, &stop).await.unwrap();
    assert_eq!(result.outcome, AttackOutcome::Completed);
    assert_eq!(result.frames_sent, 10);
    assert!(started.elapsed() < Duration::from_secs(2));

    // Every verdict plus start and end is queued, none written yet
    assert_eq!(audit.len(), 12);
    assert_eq!(audit_file.len(), 0);

    audit_file.open();
    audit.flush().await;
    assert_eq!(audit_file.len(), 12);
    assert_eq!(audit_file.inner.count_outcome("allowed"), 10);

    monitor_file.open();
    wait_for_observed(&handle, 10).await;
    let stats = handle.shutdown().await;
    assert_eq!(stats.frames_observed, 10);
}

#[tokio::test]
async fn test_capture_file_replays_observed_traffic() {
    let dir = tempfile::TempDir::new().unwrap();
    let capture_path = dir.path().join("captures").join("capture.jsonl");

    let bus = VirtualCanBus::new("vcan0", 256);
    let sink = MemoryLogSink::new();
    let handle = Monitor::new(MonitorConfig::default(), Arc::new(sink.clone()))
        .with_capture(CaptureWriter::create(&capture_path).unwrap())
        .spawn(&bus, &StopToken::new())
        .await
        .unwrap();

    let speed = CanId::from_raw(0x100).unwrap();
    let brake_status = CanId::from_raw(0x200).unwrap();
    for i in 0..5u8 {
        let id = if i % 2 == 0 { speed } else { brake_status };
        bus.send(CanFrame::new(id, vec![i, 0xAA], "ECU".to_string()))
            .await
            .unwrap();
    }

    wait_for_observed(&handle, 5).await;
    handle.shutdown().await;

    let entries = load_replay_log(&capture_path, ReplayFormat::Jsonl).unwrap();
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[0].arbitration_id, 0x100);
    assert_eq!(entries[1].arbitration_id, 0x200);
    assert_eq!(entries[4].data, vec![4, 0xAA]);

    // Feed the capture back onto a fresh bus
    let replay_bus = VirtualCanBus::new("vcan1", 64);
    let mut rx = replay_bus.subscribe();
    let engine = engine_on(&replay_bus, &MemoryLogSink::new());
    let config = AttackConfig::new(
        AttackKind::Replay {
            source: ReplaySource::file(&capture_path),
            speed: 1.0,
            id_filter: vec![0x100],
        },
        Duration::from_secs(5),
    );

    let result = engine.run(&config, &StopToken::new()).await.unwrap();
    assert_eq!(result.outcome, AttackOutcome::Completed);
    assert_eq!(result.frames_sent, 3);

    let replayed: Vec<u8> = (0..3).map(|_| rx.try_recv().unwrap().data[0]).collect();
    assert_eq!(replayed, vec![0, 2, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_observes_every_frame_an_attack_sends() {
    let bus = VirtualCanBus::new("vcan0", 1024);
    let audit = MemoryLogSink::new();
    let monitor_log = MemoryLogSink::new();
    let stop = StopToken::new();

    let handle = Monitor::new(MonitorConfig::default(), Arc::new(monitor_log.clone()))
        .spawn(&bus, &stop)
        .await
        .unwrap();

    let engine = engine_on(&bus, &audit);
    let attacks = [(0x100, 10), (0x300, 25)].map(|(target_id, interval_ms)| {
        let engine = engine.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let config = AttackConfig::new(
                AttackKind::Injection {
                    target_id,
                    payload: vec![0x01, 0x02],
                    interval_ms,
                },
                Duration::from_millis(500),
            );
            engine.run(&config, &stop).await
        })
    });

    let mut sent = 0;
    for attack in attacks {
        sent += attack.await.unwrap().unwrap().frames_sent;
    }
    assert_eq!(sent, 70);
    assert_eq!(bus.frames_carried(), sent);

    wait_for_observed(&handle, sent).await;
    let stats = handle.shutdown().await;

    assert_eq!(stats.frames_observed, sent);
    assert_eq!(stats.novel_id, 2);
    assert_eq!(stats.tracked_ids, 2);
    assert_eq!(stats.receiver_skipped, 0);
    assert_eq!(monitor_log.count_component("monitor") as u64, sent);
    assert_eq!(audit.count_component("monitor"), 0);
}

#[tokio::test]
async fn test_stop_token_ends_monitor() {
    let bus = VirtualCanBus::new("vcan0", 16);
    let stop = StopToken::new();
    let handle = Monitor::new(MonitorConfig::default(), Arc::new(MemoryLogSink::new()))
        .spawn(&bus, &stop)
        .await
        .unwrap();

    stop.stop();
    for _ in 0..1000 {
        if handle.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(handle.is_finished());
    assert_eq!(handle.shutdown().await.frames_observed, 0);
}
