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

use bytes::Bytes;

/// Width of the reserved/flags field that follows the length prefix.
///
/// Always zero on the wire today. It is the slot for future compression,
/// encryption or fragmentation flags and must stay in the frame layout.
pub const RESERVED_LEN: usize = 2;
pub const RESERVED_FLAGS: u16 = 0;
pub const MESSAGE_ID_LEN: usize = 2;
/// reserved + message id
pub const FRAME_HEADER_LEN: usize = RESERVED_LEN + MESSAGE_ID_LEN;

/// One decoded application message.
///
/// Wire layout, `total_length` counting everything after itself:
///
/// ```text
/// [ total_length: 1|2|4 bytes ][ reserved: 2 bytes = 0 ][ message_id: 2 bytes ][ payload ]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_id: u16, payload: impl Into<Bytes>) -> Self {
        Frame {
            message_id,
            payload: payload.into(),
        }
    }

    /// Length prefix value this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }
}
