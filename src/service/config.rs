// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::{ConnectionConfig, PackerConfig};

/// Prefix of environment overrides, e.g. `GAMEWIRE__NETWORK__PORT=7001`.
pub const ENV_PREFIX: &str = "GAMEWIRE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub tcp_nodelay: bool,
    pub accept_backoff_min_ms: u64,
    pub accept_backoff_max_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 7000,
            max_connection: 10_000,
            tcp_nodelay: true,
            accept_backoff_min_ms: 5,
            accept_backoff_max_ms: 1_000,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn accept_backoff_min(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_min_ms)
    }

    pub fn accept_backoff_max(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_max_ms)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 0 means one worker per cpu.
    pub worker_threads: usize,
}

impl RuntimeConfig {
    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    pub file_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: "logs".to_string(),
            file_name: "gamewire.log".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
    pub packer: PackerConfig,
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
}

impl ServerConfig {
    /// Loads the config file at `path`, applies `GAMEWIRE__*` environment
    /// overrides and validates the result.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be positive".to_string(),
            ));
        }
        if self.network.accept_backoff_min_ms == 0
            || self.network.accept_backoff_min_ms > self.network.accept_backoff_max_ms
        {
            return Err(AppError::InvalidValue(format!(
                "accept backoff must satisfy 0 < min ({}) <= max ({})",
                self.network.accept_backoff_min_ms, self.network.accept_backoff_max_ms
            )));
        }
        if self.connection.send_queue_capacity == 0 {
            return Err(AppError::InvalidValue(
                "connection.send_queue_capacity must be positive".to_string(),
            ));
        }
        self.packer.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::network::{ByteOrder, LengthFieldWidth, DEFAULT_MAX_FRAME_LEN};

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let file = write_config("");
        let config = ServerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.connection.handshake_timeout_ms, 30_000);
        assert_eq!(config.connection.final_grace_ms, 2_000);
        assert_eq!(config.packer.length_field_width, LengthFieldWidth::Four);
        assert_eq!(config.packer.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(config.packer.min_frame_len, 2);
    }

    #[test]
    fn test_sections_override_defaults() {
        let file = write_config(
            r#"
            [network]
            ip = "127.0.0.1"
            port = 9100
            max_connection = 64

            [connection]
            send_queue_capacity = 16
            handshake_timeout_ms = 0

            [packer]
            length_field_width = 2
            byte_order = "little_endian"
            max_frame_len = 4096
            "#,
        );
        let config = ServerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.listen_address(), "127.0.0.1:9100");
        assert_eq!(config.network.max_connection, 64);
        assert_eq!(config.connection.send_queue_capacity, 16);
        assert!(config.connection.handshake_timeout().is_none());
        assert_eq!(config.connection.read_buffer_size, 4096);
        assert_eq!(config.packer.length_field_width, LengthFieldWidth::Two);
        assert_eq!(config.packer.byte_order, ByteOrder::LittleEndian);
    }

    #[test]
    fn test_rejects_unsupported_width() {
        let file = write_config("[packer]\nlength_field_width = 3\n");
        assert!(ServerConfig::set_up_config(file.path()).is_err());
    }

    #[test]
    fn test_rejects_frame_len_wider_than_field() {
        let file = write_config("[packer]\nlength_field_width = 1\n");
        let err = ServerConfig::set_up_config(file.path()).unwrap_err();
        assert!(matches!(err, AppError::InvalidValue(_)));
    }

    #[test]
    fn test_rejects_zero_connection_ceiling() {
        let mut config = ServerConfig::default();
        config.network.max_connection = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ServerConfig::set_up_config("/nonexistent/gamewire.toml").is_err());
    }

    #[test]
    fn test_worker_threads_default_to_cpus() {
        assert_eq!(RuntimeConfig::default().worker_threads(), num_cpus::get());
    }
}
