/// CAN Bus Relay Server
///
/// Backs the socket-based transport: every frame a client sends is relayed to
/// every connected client, sender included, in arrival order.
use can_hydra::config::DEFAULT_BUS_ADDRESS;
use can_hydra::network::NetMessage;
use clap::Parser;
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bus_server")]
#[command(version, about = "Relay for the socket-based CAN bus", long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = DEFAULT_BUS_ADDRESS)]
    address: String,

    /// Frames buffered per client before it starts lagging
    #[arg(long, default_value = "10000")]
    buffer: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    println!(
        "{}",
        "═══════════════════════════════════════════════════════════════"
            .magenta()
            .bold()
    );
    println!(
        "{}",
        "         CAN HYDRA BUS SERVER                                  "
            .magenta()
            .bold()
    );
    println!(
        "{}",
        "═══════════════════════════════════════════════════════════════"
            .magenta()
            .bold()
    );
    println!();
    println!(
        "{} Starting bus server on {}...",
        "→".green(),
        args.address.bright_white()
    );

    let (tx, _rx) = broadcast::channel::<NetMessage>(args.buffer.max(1));
    let tx = Arc::new(tx);

    let listener = TcpListener::bind(&args.address).await?;
    println!(
        "{} Bus server ready! Waiting for connections...",
        "✓".green().bold()
    );
    println!();

    let mut client_count = 0u32;

    loop {
        let (socket, addr) = listener.accept().await?;
        client_count += 1;

        println!(
            "{} New connection from {} (Total connections: {})",
            "→".cyan(),
            addr.to_string().bright_white(),
            client_count.to_string().bright_cyan()
        );

        let tx = Arc::clone(&tx);
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, tx).await {
                eprintln!("{} Client error: {}", "✗".red(), e);
            }
        });
    }
}

async fn handle_client(
    socket: TcpStream,
    tx: Arc<broadcast::Sender<NetMessage>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let peer_addr = socket.peer_addr()?;
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    // First message must register the client
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let client_name = match serde_json::from_str::<NetMessage>(&line) {
        Ok(NetMessage::Register { client_name }) => {
            println!(
                "  {} {} registered from {}",
                "✓".green(),
                client_name.bright_cyan().bold(),
                peer_addr.to_string().bright_black()
            );
            client_name
        }
        _ => {
            let reply = serde_json::to_string(&NetMessage::Error(
                "first message must be Register".to_string(),
            ))?;
            write_half.write_all(reply.as_bytes()).await?;
            write_half.write_all(b"\n").await?;
            return Err("first message must be Register".into());
        }
    };

    // Subscribe before reading frames so this client sees its own sends
    let mut rx = tx.subscribe();

    let forward_name = client_name.clone();
    tokio::spawn(async move {
        loop {
            let msg = match rx.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!(
                        "{} Client {} lagged, skipped {} messages (recovering...)",
                        "⚠".yellow(),
                        forward_name.bright_cyan(),
                        skipped
                    );
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(_) => continue,
            };

            if write_half.write_all(json.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
                || write_half.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut frame_count = 0u64;
    let mut rejected_count = 0u64;
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }

        let msg: NetMessage = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                rejected_count += 1;
                debug!(client = %client_name, error = %e, "undecodable message dropped");
                continue;
            }
        };

        if let NetMessage::CanFrame(frame) = msg {
            if !frame.is_valid() {
                rejected_count += 1;
                eprintln!(
                    "{} Invalid frame {} from {} dropped",
                    "⚠".yellow(),
                    frame.id,
                    client_name.bright_cyan()
                );
                continue;
            }

            frame_count += 1;
            debug!(
                client = %client_name,
                frame = frame_count,
                can_id = %frame.id,
                "relaying frame"
            );

            // No subscribers is not an error for a relay
            let _ = tx.send(NetMessage::CanFrame(frame));
        }
    }

    println!(
        "{} {} disconnected (sent {} frames, {} rejected)",
        "→".bright_black(),
        client_name.bright_black(),
        frame_count,
        rejected_count
    );

    Ok(())
}
