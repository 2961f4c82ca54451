use crate::error::TransportError;
use crate::types::CanFrame;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Shared broadcast channel that frames are sent on and observed from
///
/// Every receiver opened on a transport sees every frame sent after it was
/// opened, in delivery order.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Name of the logical channel (virtual channel name or socket address)
    fn channel_name(&self) -> &str;

    async fn send(&self, frame: CanFrame) -> Result<(), TransportError>;

    /// Open an independent observer on the channel
    async fn open_receiver(&self) -> Result<Box<dyn FrameReceiver>, TransportError>;
}

/// One observer's view of a channel
#[async_trait]
pub trait FrameReceiver: Send {
    /// Wait for the next frame (one frame per call)
    async fn receive(&mut self) -> Result<CanFrame, TransportError>;

    /// Frames this receiver missed because it fell behind
    fn skipped(&self) -> u64 {
        0
    }
}

/// Virtual CAN Bus
/// Uses broadcast channels to simulate a real CAN bus where all nodes see all messages
#[derive(Clone)]
pub struct VirtualCanBus {
    channel: String,
    tx: broadcast::Sender<CanFrame>,
    frames_carried: Arc<AtomicU64>,
}

impl VirtualCanBus {
    /// Create a named virtual bus buffering up to `capacity` frames per receiver
    pub fn new(channel: impl Into<String>, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            channel: channel.into(),
            tx,
            frames_carried: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to receive frames from the bus
    pub fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.tx.subscribe()
    }

    /// Get the number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total frames put on the wire since creation
    pub fn frames_carried(&self) -> u64 {
        self.frames_carried.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BusTransport for VirtualCanBus {
    fn channel_name(&self) -> &str {
        &self.channel
    }

    async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        if !frame.is_valid() {
            return Err(TransportError::Codec(format!(
                "invalid CAN frame {} ({} data bytes)",
                frame.id,
                frame.data.len()
            )));
        }

        self.frames_carried.fetch_add(1, Ordering::Relaxed);
        // A send with nobody listening is still a successful transmission
        let _ = self.tx.send(frame);
        Ok(())
    }

    async fn open_receiver(&self) -> Result<Box<dyn FrameReceiver>, TransportError> {
        Ok(Box::new(VirtualReceiver {
            channel: self.channel.clone(),
            rx: self.tx.subscribe(),
            skipped: 0,
        }))
    }
}

struct VirtualReceiver {
    channel: String,
    rx: broadcast::Receiver<CanFrame>,
    skipped: u64,
}

#[async_trait]
impl FrameReceiver for VirtualReceiver {
    async fn receive(&mut self) -> Result<CanFrame, TransportError> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Ok(frame.observed()),
                Err(RecvError::Lagged(n)) => {
                    // Continue receiving after lag instead of dying
                    self.skipped += n;
                    tracing::warn!(channel = %self.channel, skipped = n, "receiver lagged");
                }
                Err(RecvError::Closed) => {
                    return Err(TransportError::Closed {
                        channel: self.channel.clone(),
                    });
                }
            }
        }
    }

    fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanId, FrameDirection};

    #[tokio::test]
    async fn test_can_bus_broadcast() {
        let bus = VirtualCanBus::new("vcan0", 100);
        let mut rx1 = bus.open_receiver().await.unwrap();
        let mut rx2 = bus.open_receiver().await.unwrap();

        let frame = CanFrame::new(
            CanId::Standard(0x123),
            vec![0x01, 0x02, 0x03],
            "TEST_ECU".to_string(),
        );

        bus.send(frame.clone()).await.unwrap();

        let received1 = rx1.receive().await.unwrap();
        let received2 = rx2.receive().await.unwrap();

        assert_eq!(received1.id, frame.id);
        assert_eq!(received2.id, frame.id);
        assert_eq!(received1.direction, FrameDirection::Observed);
        assert_eq!(bus.frames_carried(), 1);
        assert_eq!(bus.channel_name(), "vcan0");
    }

    #[tokio::test]
    async fn test_send_without_observers_succeeds() {
        let bus = VirtualCanBus::new("vcan0", 4);
        let frame = CanFrame::new(CanId::Standard(0x100), vec![0x01], "T".to_string());
        assert!(bus.send(frame).await.is_ok());
        assert_eq!(bus.frames_carried(), 1);
    }

    #[tokio::test]
    async fn test_invalid_frame_rejected() {
        let bus = VirtualCanBus::new("vcan0", 4);
        let frame = CanFrame::new(CanId::Standard(0x100), vec![0; 9], "T".to_string());
        assert!(matches!(
            bus.send(frame).await,
            Err(TransportError::Codec(_))
        ));
        assert_eq!(bus.frames_carried(), 0);
    }

    #[tokio::test]
    async fn test_lagged_receiver_recovers() {
        let bus = VirtualCanBus::new("vcan0", 2);
        let mut rx = bus.open_receiver().await.unwrap();

        for i in 0..5u8 {
            let frame = CanFrame::new(CanId::Standard(0x100), vec![i], "T".to_string());
            bus.send(frame).await.unwrap();
        }

        let next = rx.receive().await.unwrap();
        assert_eq!(next.data, vec![3]);
        assert_eq!(rx.skipped(), 3);
    }
}
