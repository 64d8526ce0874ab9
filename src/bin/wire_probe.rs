use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gamewire::{
    setup_local_tracing, AppResult, ByteOrder, Client, ConnHandler, Connection, ConnectionConfig,
    Frame, LengthFieldWidth, Packer, PackerConfig,
};

/// Dials a gamewire server, sends frames and prints whatever comes back.
#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    pub addr: String,
    /// message id of the frames to send
    #[arg(short, long, default_value_t = 1)]
    pub id: u16,
    #[arg(short, long, default_value = "hello")]
    pub payload: String,
    #[arg(short, long, default_value_t = 1)]
    pub count: usize,
    /// how long to wait for replies
    #[arg(short, long, default_value_t = 500)]
    pub wait_ms: u64,
    /// length field width in bytes (1, 2 or 4)
    #[arg(long, default_value_t = 4)]
    pub width: u8,
    #[arg(long)]
    pub little_endian: bool,
    /// largest accepted length prefix, defaults to what the width can carry
    #[arg(long)]
    pub max_frame_len: Option<usize>,
}

struct PrintHandler;

impl ConnHandler for PrintHandler {
    fn on_connect(&self, conn: &Arc<Connection>) {
        println!("connected to {:?} as {}", conn.peer_addr(), conn.id());
    }

    fn on_message(&self, frame: Frame, _conn: &Arc<Connection>) {
        println!(
            "<- id={} len={} payload={}",
            frame.message_id,
            frame.payload.len(),
            String::from_utf8_lossy(&frame.payload)
        );
    }

    fn on_close(&self, _conn: &Arc<Connection>) {
        println!("connection closed");
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    setup_local_tracing()?;
    let commandline = CommandLine::parse();

    let byte_order = if commandline.little_endian {
        ByteOrder::LittleEndian
    } else {
        ByteOrder::BigEndian
    };
    let mut packer_config =
        PackerConfig::with_width(LengthFieldWidth::try_from(commandline.width)?, byte_order);
    if let Some(max_frame_len) = commandline.max_frame_len {
        packer_config.max_frame_len = max_frame_len;
    }
    let packer = Packer::new(packer_config)?;
    let config = ConnectionConfig {
        handshake_timeout_ms: 0,
        ..ConnectionConfig::default()
    };

    let mut client = Client::new(packer, config, Arc::new(PrintHandler));
    let conn = client.dial(&commandline.addr).await?;
    for _ in 0..commandline.count {
        if !conn.async_send(commandline.id, commandline.payload.as_bytes()) {
            eprintln!("send failed, connection closed");
            break;
        }
        println!("-> id={} len={}", commandline.id, commandline.payload.len());
    }

    tokio::time::sleep(Duration::from_millis(commandline.wait_ms)).await;
    client.close().await;
    Ok(())
}
