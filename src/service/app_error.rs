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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// frame protocol errors, always fatal to the connection
    #[error("frame of length {len} is too long, max {max}")]
    FrameTooLong { len: usize, max: usize },

    #[error("frame of length {len} is too short, min {min}")]
    FrameTooShort { len: usize, min: usize },

    #[error("frame body of {0} bytes has no message id")]
    ShortFrameBody(usize),

    #[error("payload of {len} bytes does not fit in a frame, max frame length {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("no complete frame within {0}ms")]
    ReadTimeout(u64),

    #[error("connection reset by peer in the middle of a frame")]
    ConnectionReset,
}

impl AppError {
    /// Errors that mean the peer broke the framing contract, as opposed to
    /// plain socket failures.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            AppError::FrameTooLong { .. }
                | AppError::FrameTooShort { .. }
                | AppError::ShortFrameBody(_)
                | AppError::ConnectionReset
        )
    }
}
