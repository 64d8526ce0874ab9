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

//! Growable byte buffer with separate read/write cursors.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index    <=    capacity
//! ```
//!
//! The first `prepend_size` bytes are kept free by ordinary writes, so a
//! length header can be put in front of an already serialized payload
//! without moving it.
//!
//! None of the operations return errors. Reading more than
//! [`ByteBuffer::readable_bytes`] is a caller bug and panics.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

macro_rules! append_uint {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, value: $ty) {
            match self.byte_order {
                ByteOrder::BigEndian => self.append(&value.to_be_bytes()),
                ByteOrder::LittleEndian => self.append(&value.to_le_bytes()),
            }
        }
    };
}

macro_rules! prepend_uint {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, value: $ty) {
            match self.byte_order {
                ByteOrder::BigEndian => self.prepend(&value.to_be_bytes()),
                ByteOrder::LittleEndian => self.prepend(&value.to_le_bytes()),
            }
        }
    };
}

macro_rules! read_uint {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            let mut raw = [0u8; SIZE];
            raw.copy_from_slice(self.peek_exact(SIZE));
            self.retrieve(SIZE);
            match self.byte_order {
                ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
            }
        }
    };
}

#[derive(Debug)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
    prepend_size: usize,
    byte_order: ByteOrder,
}

impl ByteBuffer {
    pub fn new(initial_size: usize, prepend_size: usize, byte_order: ByteOrder) -> Self {
        ByteBuffer {
            buf: vec![0; prepend_size + initial_size],
            reader_index: prepend_size,
            writer_index: prepend_size,
            prepend_size,
            byte_order,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    /// Unread content, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    fn peek_exact(&self, len: usize) -> &[u8] {
        assert!(
            len <= self.readable_bytes(),
            "read of {} bytes past write cursor, {} readable",
            len,
            self.readable_bytes()
        );
        &self.buf[self.reader_index..self.reader_index + len]
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    append_uint!(append_u8, u8);
    append_uint!(append_u16, u16);
    append_uint!(append_u32, u32);
    append_uint!(append_u64, u64);

    /// Writes `data` into the reserved space right in front of the readable
    /// region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend of {} bytes, only {} prependable",
            data.len(),
            self.prependable_bytes()
        );
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    prepend_uint!(prepend_u8, u8);
    prepend_uint!(prepend_u16, u16);
    prepend_uint!(prepend_u32, u32);

    read_uint!(read_u8, u8);
    read_uint!(read_u16, u16);
    read_uint!(read_u32, u32);
    read_uint!(read_u64, u64);

    /// Consumes and returns the next `len` readable bytes.
    pub fn next_bytes(&mut self, len: usize) -> Bytes {
        let bytes = Bytes::copy_from_slice(self.peek_exact(len));
        self.retrieve(len);
        bytes
    }

    pub fn skip(&mut self, len: usize) {
        self.peek_exact(len);
        self.retrieve(len);
    }

    fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.reset();
        }
    }

    /// Drops all unread content and moves both cursors back to the
    /// reserved boundary.
    pub fn reset(&mut self) {
        self.reader_index = self.prepend_size;
        self.writer_index = self.prepend_size;
    }

    /// Returns a writable slice of exactly `len` bytes starting at the write
    /// cursor. The bytes only become readable after [`Self::has_written`].
    pub fn writable_slice(&mut self, len: usize) -> &mut [u8] {
        self.ensure_writable(len);
        &mut self.buf[self.writer_index..self.writer_index + len]
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        let readable = self.readable_bytes();
        if self.writable_bytes() + self.prependable_bytes() < len + self.prepend_size {
            let capacity = self.buf.len();
            let new_capacity = (capacity * 2).max(capacity + len + self.prepend_size);
            let mut grown = vec![0; new_capacity];
            grown[self.prepend_size..self.prepend_size + readable]
                .copy_from_slice(&self.buf[self.reader_index..self.writer_index]);
            self.buf = grown;
        } else {
            // enough room once the consumed front is reclaimed
            self.buf
                .copy_within(self.reader_index..self.writer_index, self.prepend_size);
        }
        self.reader_index = self.prepend_size;
        self.writer_index = self.prepend_size + readable;
    }
}
