//! Network Module Implementation
//!
//! This module provides the transport every client session rides on:
//! framing, per-connection reader/writer tasks and outbound dialing.
//!
//! # Architecture
//!
//! The network module is built on tokio's async I/O primitives and consists of:
//! - `ByteBuffer`: growable buffer with a reserved front for length headers
//! - `Packer`: the length-prefixed frame codec
//! - `Connection`: one socket driven by a reader task and a writer task
//! - `Client`: outbound connections, redialable without reallocating queues
//!
//! # Wire format
//!
//! ```text
//! [ total_length: 1|2|4 bytes ][ reserved: 2 bytes ][ message_id: 2 bytes ][ payload ]
//! ```
//!
//! # Features
//!
//! - Frame size validation on both the read and the pack side
//! - Bounded send queue that disconnects peers which do not keep up
//! - Handshake watchdog evicting connections that never authenticate
//! - "Last message, then close" final-priority sends

pub use byte_buffer::{ByteBuffer, ByteOrder};
pub use conn_id::{ConnIdGenerator, ConnectionId};
pub use connection::{ConnHandler, ConnState, Connection, ConnectionConfig};
pub use dialer::Client;
pub use frame::{Frame, FRAME_HEADER_LEN, MESSAGE_ID_LEN, RESERVED_LEN};
pub use packer::{LengthFieldWidth, Packer, PackerConfig, DEFAULT_MAX_FRAME_LEN, DEFAULT_MIN_FRAME_LEN};

mod byte_buffer;
mod conn_id;
mod connection;
mod dialer;
mod frame;
mod packer;
