pub mod network;
pub mod service;

pub use network::{
    ByteBuffer, ByteOrder, Client, ConnHandler, ConnState, Connection, ConnectionConfig,
    ConnectionId, Frame, LengthFieldWidth, Packer, PackerConfig,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ConnectionRegistry, Gateway, Server,
    ServerConfig, Shutdown,
};
