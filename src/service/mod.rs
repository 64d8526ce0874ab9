pub use app_error::{AppError, AppResult};
pub use config::{LogConfig, NetworkConfig, RuntimeConfig, ServerConfig, ENV_PREFIX};
pub use gateway::Gateway;
pub use registry::ConnectionRegistry;
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod gateway;
mod registry;
mod server;
mod shutdown;
mod tracing_config;
