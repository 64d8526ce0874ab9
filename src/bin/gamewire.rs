use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use gamewire::{setup_tracing, AppResult, ConnHandler, Connection, Frame, Gateway, ServerConfig};
use tracing::info;

/// Handshake: marks the connection verified and acks with the same id.
const MSG_HANDSHAKE: u16 = 1;
/// Asks the server to say goodbye and disconnect.
const MSG_QUIT: u16 = 0xFFFF;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Stand-in for the game layer: echoes every frame back.
struct EchoHandler;

impl ConnHandler for EchoHandler {
    fn on_connect(&self, conn: &Arc<Connection>) {
        info!(conn = %conn.id(), peer = ?conn.peer_addr(), "client connected");
    }

    fn on_message(&self, frame: Frame, conn: &Arc<Connection>) {
        match frame.message_id {
            MSG_HANDSHAKE => {
                conn.mark_verified();
                conn.async_send(MSG_HANDSHAKE, b"welcome");
            }
            MSG_QUIT => {
                conn.async_send_final(MSG_QUIT, b"bye");
            }
            id => {
                conn.async_send(id, &frame.payload);
            }
        }
    }

    fn on_close(&self, conn: &Arc<Connection>) {
        info!(conn = %conn.id(), peer = ?conn.peer_addr(), "client disconnected");
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = ServerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let _log_guard = setup_tracing(&config.log, commandline.verbose)?;
    info!(addr = %config.network.listen_address(), "starting gamewire");

    let gateway = Gateway::new(config);
    gateway.start(Arc::new(EchoHandler))
}
