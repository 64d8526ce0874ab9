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

//! Frame codec.
//!
//! `pack` builds `reserved + message_id + payload` without the length prefix,
//! so the packed bytes can be measured and queued before they are framed.
//! The write path adds the prefix in the reserved front of a [`ByteBuffer`]
//! via [`Packer::write_frame`]. The read path does the reverse in
//! [`Packer::read_frame`] and [`Packer::unpack`].

use std::io::ErrorKind;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::byte_buffer::{ByteBuffer, ByteOrder};
use super::frame::{Frame, FRAME_HEADER_LEN, MESSAGE_ID_LEN, RESERVED_FLAGS, RESERVED_LEN};
use crate::{AppError, AppResult};

pub const DEFAULT_MIN_FRAME_LEN: usize = 2;
pub const DEFAULT_MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LengthFieldWidth {
    One,
    Two,
    #[default]
    Four,
}

impl LengthFieldWidth {
    pub fn size(self) -> usize {
        match self {
            LengthFieldWidth::One => 1,
            LengthFieldWidth::Two => 2,
            LengthFieldWidth::Four => 4,
        }
    }

    /// Largest length the field can carry.
    pub fn max_value(self) -> usize {
        match self {
            LengthFieldWidth::One => u8::MAX as usize,
            LengthFieldWidth::Two => u16::MAX as usize,
            LengthFieldWidth::Four => u32::MAX as usize,
        }
    }
}

impl TryFrom<u8> for LengthFieldWidth {
    type Error = AppError;

    fn try_from(value: u8) -> AppResult<Self> {
        match value {
            1 => Ok(LengthFieldWidth::One),
            2 => Ok(LengthFieldWidth::Two),
            4 => Ok(LengthFieldWidth::Four),
            other => Err(AppError::InvalidValue(format!(
                "length field width must be 1, 2 or 4, got {}",
                other
            ))),
        }
    }
}

impl From<LengthFieldWidth> for u8 {
    fn from(value: LengthFieldWidth) -> Self {
        value.size() as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackerConfig {
    pub length_field_width: LengthFieldWidth,
    pub byte_order: ByteOrder,
    pub min_frame_len: usize,
    pub max_frame_len: usize,
}

impl Default for PackerConfig {
    fn default() -> Self {
        PackerConfig::with_width(LengthFieldWidth::Four, ByteOrder::BigEndian)
    }
}

impl PackerConfig {
    /// Defaults for `width`, with `max_frame_len` capped to what the length
    /// field can carry.
    pub fn with_width(width: LengthFieldWidth, byte_order: ByteOrder) -> Self {
        PackerConfig {
            length_field_width: width,
            byte_order,
            min_frame_len: DEFAULT_MIN_FRAME_LEN,
            max_frame_len: DEFAULT_MAX_FRAME_LEN.min(width.max_value()),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.min_frame_len < RESERVED_LEN {
            return Err(AppError::InvalidValue(format!(
                "min_frame_len {} is shorter than the reserved field",
                self.min_frame_len
            )));
        }
        if self.min_frame_len > self.max_frame_len {
            return Err(AppError::InvalidValue(format!(
                "min_frame_len {} exceeds max_frame_len {}",
                self.min_frame_len, self.max_frame_len
            )));
        }
        if self.max_frame_len > self.length_field_width.max_value() {
            return Err(AppError::InvalidValue(format!(
                "max_frame_len {} does not fit in a {}-byte length field",
                self.max_frame_len,
                self.length_field_width.size()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Packer {
    config: PackerConfig,
}

impl Packer {
    pub fn new(config: PackerConfig) -> AppResult<Packer> {
        config.validate()?;
        Ok(Packer { config })
    }

    pub fn config(&self) -> &PackerConfig {
        &self.config
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.config.byte_order
    }

    /// Largest payload a single frame can carry.
    pub fn max_payload_len(&self) -> usize {
        self.config.max_frame_len.saturating_sub(FRAME_HEADER_LEN)
    }

    /// Buffer for the read side, no reserved front needed.
    pub fn read_buffer(&self, initial_size: usize) -> ByteBuffer {
        ByteBuffer::new(initial_size, 0, self.config.byte_order)
    }

    /// Buffer for the write side, with room for the length prefix in front.
    pub fn write_buffer(&self, initial_size: usize) -> ByteBuffer {
        ByteBuffer::new(
            initial_size,
            self.config.length_field_width.size(),
            self.config.byte_order,
        )
    }

    /// Builds `reserved + message_id + payload`. The length prefix is added
    /// later by [`Packer::write_frame`].
    pub fn pack(&self, message_id: u16, payload: &[u8]) -> AppResult<Bytes> {
        let total_len = FRAME_HEADER_LEN + payload.len();
        if total_len > self.config.max_frame_len {
            return Err(AppError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_frame_len,
            });
        }
        let mut packed = BytesMut::with_capacity(total_len);
        match self.config.byte_order {
            ByteOrder::BigEndian => {
                packed.put_u16(RESERVED_FLAGS);
                packed.put_u16(message_id);
            }
            ByteOrder::LittleEndian => {
                packed.put_u16_le(RESERVED_FLAGS);
                packed.put_u16_le(message_id);
            }
        }
        packed.extend_from_slice(payload);
        Ok(packed.freeze())
    }

    /// Puts one packed frame into an empty write buffer and writes its
    /// length prefix into the reserved front. The readable region of `buf`
    /// is then exactly the wire bytes of the frame.
    pub fn write_frame(&self, packed: &[u8], buf: &mut ByteBuffer) {
        debug_assert_eq!(buf.readable_bytes(), 0, "frames are framed one at a time");
        buf.append(packed);
        let len = packed.len();
        match self.config.length_field_width {
            LengthFieldWidth::One => buf.prepend_u8(len as u8),
            LengthFieldWidth::Two => buf.prepend_u16(len as u16),
            LengthFieldWidth::Four => buf.prepend_u32(len as u32),
        }
    }

    /// Full wire bytes of a frame, length prefix included.
    pub fn encode(&self, message_id: u16, payload: &[u8]) -> AppResult<Bytes> {
        let packed = self.pack(message_id, payload)?;
        let mut buf = self.write_buffer(packed.len());
        self.write_frame(&packed, &mut buf);
        Ok(Bytes::copy_from_slice(buf.peek()))
    }

    /// Reads one frame from `reader` and returns its body
    /// (`message_id + payload`), with the reserved field skipped.
    ///
    /// Returns `Ok(None)` if the peer closed the stream cleanly on a frame
    /// boundary. EOF inside a frame is [`AppError::ConnectionReset`].
    pub async fn read_frame<R>(&self, reader: &mut R, buf: &mut ByteBuffer) -> AppResult<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        buf.reset();
        let width = self.config.length_field_width.size();
        let field = buf.writable_slice(width);
        let mut filled = 0;
        while filled < width {
            let n = reader.read(&mut field[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(AppError::ConnectionReset)
                };
            }
            filled += n;
        }
        buf.has_written(width);

        let len = match self.config.length_field_width {
            LengthFieldWidth::One => buf.read_u8() as usize,
            LengthFieldWidth::Two => buf.read_u16() as usize,
            LengthFieldWidth::Four => buf.read_u32() as usize,
        };
        if len > self.config.max_frame_len {
            return Err(AppError::FrameTooLong {
                len,
                max: self.config.max_frame_len,
            });
        }
        if len < self.config.min_frame_len {
            return Err(AppError::FrameTooShort {
                len,
                min: self.config.min_frame_len,
            });
        }

        reader
            .read_exact(buf.writable_slice(len))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => AppError::ConnectionReset,
                _ => AppError::IoError(e),
            })?;
        buf.has_written(len);
        buf.skip(RESERVED_LEN);
        Ok(Some(buf.next_bytes(len - RESERVED_LEN)))
    }

    /// Splits a frame body into message id and payload.
    pub fn unpack(&self, mut body: Bytes) -> AppResult<Frame> {
        if body.len() < MESSAGE_ID_LEN {
            return Err(AppError::ShortFrameBody(body.len()));
        }
        let message_id = match self.config.byte_order {
            ByteOrder::BigEndian => body.get_u16(),
            ByteOrder::LittleEndian => body.get_u16_le(),
        };
        Ok(Frame {
            message_id,
            payload: body,
        })
    }
}
