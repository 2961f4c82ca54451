use crate::can_bus::{BusTransport, FrameReceiver};
use crate::error::TransportError;
use crate::types::CanFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

/// Network message types (newline-delimited JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetMessage {
    /// CAN frame relayed to every connected client
    CanFrame(CanFrame),
    /// Client registration (first message on a connection)
    Register { client_name: String },
    /// Acknowledgment
    Ack,
    /// Error message
    Error(String),
}

/// Network client for communicating with the bus server
pub struct BusClient {
    stream: TcpStream,
    client_name: String,
}

impl BusClient {
    /// Connect to the bus server and register
    pub async fn connect(addr: &str, client_name: String) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Unavailable(format!("{}: {}", addr, e)))?;
        let mut client = Self {
            stream,
            client_name: client_name.clone(),
        };

        client
            .send_message(&NetMessage::Register { client_name })
            .await?;

        Ok(client)
    }

    pub async fn send_message(&mut self, msg: &NetMessage) -> Result<(), TransportError> {
        write_message(&mut self.stream, msg).await
    }

    /// Split the client into read and write halves
    pub fn split(self) -> (BusReader, BusWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            BusReader {
                reader: BufReader::new(read_half),
                line: String::new(),
            },
            BusWriter { writer: write_half },
        )
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }
}

async fn write_message<W>(writer: &mut W, msg: &NetMessage) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(msg)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read half of the bus client
pub struct BusReader {
    reader: BufReader<OwnedReadHalf>,
    line: String,
}

impl BusReader {
    /// Receive the next message from the server
    pub async fn receive_message(&mut self) -> Result<NetMessage, TransportError> {
        self.line.clear();
        let n = self.reader.read_line(&mut self.line).await?;

        if n == 0 {
            return Err(TransportError::Io("connection closed".to_string()));
        }

        Ok(serde_json::from_str(&self.line)?)
    }
}

/// Write half of the bus client
pub struct BusWriter {
    writer: OwnedWriteHalf,
}

impl BusWriter {
    pub async fn send_message(&mut self, msg: &NetMessage) -> Result<(), TransportError> {
        write_message(&mut self.writer, msg).await
    }

    /// Send a CAN frame to the bus
    pub async fn send_frame(&mut self, frame: CanFrame) -> Result<(), TransportError> {
        self.send_message(&NetMessage::CanFrame(frame)).await
    }
}

/// Socket-based bus backed by a `bus_server` relay
///
/// Sending uses one long-lived connection. Each receiver opens its own
/// connection so observers never contend with senders.
pub struct TcpBus {
    address: String,
    client_name: String,
    writer: Mutex<BusWriter>,
}

impl TcpBus {
    pub async fn connect(address: &str, client_name: &str) -> Result<Self, TransportError> {
        let client = BusClient::connect(address, client_name.to_string()).await?;
        let (mut echo, writer) = client.split();

        // The relay echoes our own frames back; drain them so the socket never backs up
        tokio::spawn(async move { while echo.receive_message().await.is_ok() {} });

        tracing::info!(address, client = client_name, "connected to bus server");

        Ok(Self {
            address: address.to_string(),
            client_name: client_name.to_string(),
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl BusTransport for TcpBus {
    fn channel_name(&self) -> &str {
        &self.address
    }

    async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        if !frame.is_valid() {
            return Err(TransportError::Codec(format!(
                "invalid CAN frame {} ({} data bytes)",
                frame.id,
                frame.data.len()
            )));
        }
        self.writer.lock().await.send_frame(frame).await
    }

    async fn open_receiver(&self) -> Result<Box<dyn FrameReceiver>, TransportError> {
        let client =
            BusClient::connect(&self.address, format!("{}-observer", self.client_name)).await?;
        let (reader, writer) = client.split();
        Ok(Box::new(TcpReceiver {
            reader,
            _writer: writer,
        }))
    }
}

struct TcpReceiver {
    reader: BusReader,
    // Held so the relay keeps the observer connection registered
    _writer: BusWriter,
}

#[async_trait]
impl FrameReceiver for TcpReceiver {
    async fn receive(&mut self) -> Result<CanFrame, TransportError> {
        loop {
            match self.reader.receive_message().await? {
                NetMessage::CanFrame(frame) => return Ok(frame.observed()),
                NetMessage::Error(e) => tracing::warn!(error = %e, "bus server reported error"),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CanId;
    use tokio::net::TcpListener;

    #[test]
    fn test_net_message_is_single_line_json() {
        let frame = CanFrame::new(CanId::Standard(0x100), vec![0xAA, 0x55], "T".to_string());
        let json = serde_json::to_string(&NetMessage::CanFrame(frame.clone())).unwrap();
        assert!(!json.contains('\n'));

        match serde_json::from_str::<NetMessage>(&json).unwrap() {
            NetMessage::CanFrame(decoded) => assert_eq!(decoded, frame),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_registers_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            serde_json::from_str::<NetMessage>(&line).unwrap()
        });

        let client = BusClient::connect(&addr, "ATTACKER".to_string())
            .await
            .unwrap();
        assert_eq!(client.client_name(), "ATTACKER");

        match server.await.unwrap() {
            NetMessage::Register { client_name } => assert_eq!(client_name, "ATTACKER"),
            other => panic!("expected Register, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpBus::connect(&addr, "ATTACKER").await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }
}
