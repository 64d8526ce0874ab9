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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{ByteBuffer, ConnectionId, Frame, Packer};
use crate::{AppError, AppResult};

/// Callbacks the transport invokes for every connection it runs.
///
/// Callbacks run on the connection's own tasks and must not block; replies
/// go through [`Connection::async_send`], which never waits.
pub trait ConnHandler: Send + Sync + 'static {
    fn on_connect(&self, conn: &Arc<Connection>);
    fn on_message(&self, frame: Frame, conn: &Arc<Connection>);
    /// Fires once, after both the reader and the writer have exited.
    fn on_close(&self, conn: &Arc<Connection>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Unstarted = 0,
    Open = 1,
    Closed = 2,
}

impl From<u8> for ConnState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnState::Unstarted,
            1 => ConnState::Open,
            _ => ConnState::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Capacity of the normal-priority send queue.
    pub send_queue_capacity: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// 0 disables the handshake watchdog.
    pub handshake_timeout_ms: u64,
    /// Upper bound on receiving one whole frame. 0 disables it.
    pub read_timeout_ms: u64,
    /// How long the writer lingers after flushing a final frame.
    pub final_grace_ms: u64,
    pub dial_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            send_queue_capacity: 1024,
            read_buffer_size: 4 * 1024,
            write_buffer_size: 4 * 1024,
            handshake_timeout_ms: 30_000,
            read_timeout_ms: 60_000,
            final_grace_ms: 2_000,
            dial_timeout_ms: 5_000,
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn final_grace(&self) -> Duration {
        Duration::from_millis(self.final_grace_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// One socket, one reader task, one writer task.
///
/// State moves `Unstarted -> Open -> Closed`. [`Connection::reset`] brings a
/// finished connection back to `Unstarted` so a client can redial it while
/// keeping its queues.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    packer: Packer,
    config: ConnectionConfig,
    state: AtomicU8,
    verified: AtomicBool,
    peer_addr: Mutex<Option<SocketAddr>>,
    stop: Mutex<CancellationToken>,
    normal_tx: Sender<Bytes>,
    normal_rx: Receiver<Bytes>,
    final_tx: Sender<Bytes>,
    final_rx: Receiver<Bytes>,
}

/// Closes the connection when a loop exits, panics included.
struct CloseGuard<'a>(&'a Connection);

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl Connection {
    pub fn new(id: ConnectionId, packer: Packer, config: ConnectionConfig) -> Connection {
        let (normal_tx, normal_rx) = async_channel::bounded(config.send_queue_capacity.max(1));
        let (final_tx, final_rx) = async_channel::bounded(1);
        Connection {
            id,
            packer,
            config,
            state: AtomicU8::new(ConnState::Unstarted as u8),
            verified: AtomicBool::new(false),
            peer_addr: Mutex::new(None),
            stop: Mutex::new(CancellationToken::new()),
            normal_tx,
            normal_rx,
            final_tx,
            final_rx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    /// Marks the peer as authenticated, which disarms the handshake watchdog.
    pub fn mark_verified(&self) {
        self.verified.store(true, Ordering::Release);
    }

    /// Frames waiting in the normal queue.
    pub fn pending_sends(&self) -> usize {
        self.normal_rx.len()
    }

    /// Queues a frame without waiting.
    ///
    /// Returns false if the connection is closed, the payload cannot be
    /// framed, or the queue is full. A full queue means the peer does not
    /// keep up, and the connection is closed.
    pub fn async_send(&self, message_id: u16, payload: &[u8]) -> bool {
        let Some(packed) = self.pack_outbound(message_id, payload) else {
            return false;
        };
        match self.normal_tx.try_send(packed) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    conn = %self.id,
                    peer = ?self.peer_addr(),
                    capacity = self.config.send_queue_capacity,
                    "send queue full, closing slow connection"
                );
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queues the last frame of this connection. The writer flushes
    /// everything queued before it, then this frame, waits the grace period
    /// and closes. Only one final frame can be pending.
    pub fn async_send_final(&self, message_id: u16, payload: &[u8]) -> bool {
        let Some(packed) = self.pack_outbound(message_id, payload) else {
            return false;
        };
        match self.final_tx.try_send(packed) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn = %self.id, message_id, "final frame already queued, dropping");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn pack_outbound(&self, message_id: u16, payload: &[u8]) -> Option<Bytes> {
        if self.is_closed() {
            return None;
        }
        match self.packer.pack(message_id, payload) {
            Ok(packed) => Some(packed),
            Err(e) => {
                error!(conn = %self.id, message_id, error = %e, "dropping outbound frame");
                None
            }
        }
    }

    /// Closes the connection. Only the first call does anything; returns
    /// whether it was this one.
    pub fn close(&self) -> bool {
        let prev = ConnState::from(self.state.swap(ConnState::Closed as u8, Ordering::AcqRel));
        if prev == ConnState::Closed {
            return false;
        }
        self.stop.lock().cancel();
        debug!(conn = %self.id, from = ?prev, "connection closed");
        true
    }

    /// Returns a closed (or never started) connection to `Unstarted`,
    /// dropping whatever is still queued. The previous session must have
    /// fully finished.
    pub fn reset(&self) -> AppResult<()> {
        if self.state() == ConnState::Open {
            return Err(AppError::IllegalStateError(format!(
                "connection {} is open and cannot be reset",
                self.id
            )));
        }
        while self.normal_rx.try_recv().is_ok() {}
        while self.final_rx.try_recv().is_ok() {}
        *self.stop.lock() = CancellationToken::new();
        *self.peer_addr.lock() = None;
        self.verified.store(false, Ordering::Release);
        self.state.store(ConnState::Unstarted as u8, Ordering::Release);
        trace!(conn = %self.id, "connection reset");
        Ok(())
    }

    /// Runs the connection over `stream` until it closes.
    ///
    /// Spawns the reader, the writer and the handshake watchdog, and waits
    /// for all three. `on_close` fires only after reader and writer are gone.
    #[tracing::instrument(skip_all, fields(conn = %self.id))]
    pub async fn serve(self: &Arc<Self>, stream: TcpStream, handler: Arc<dyn ConnHandler>) -> AppResult<()> {
        *self.peer_addr.lock() = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        self.serve_split(reader, writer, handler).await
    }

    async fn serve_split<R, W>(self: &Arc<Self>, reader: R, writer: W, handler: Arc<dyn ConnHandler>) -> AppResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(actual) = self.state.compare_exchange(
            ConnState::Unstarted as u8,
            ConnState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(AppError::IllegalStateError(format!(
                "connection {} is {:?}, expected Unstarted",
                self.id,
                ConnState::from(actual)
            )));
        }
        let stop = self.stop.lock().clone();
        debug!(peer = ?self.peer_addr(), "connection open");

        handler.on_connect(self);

        let read_task = tokio::spawn(self.clone().read_loop(reader, handler.clone(), stop.clone()));
        let write_task = tokio::spawn(self.clone().write_loop(writer, stop.clone()));
        let watchdog = tokio::spawn(self.clone().watch_handshake(stop));

        if let Err(e) = read_task.await {
            error!(conn = %self.id, error = %e, "reader task failed");
        }
        if let Err(e) = write_task.await {
            error!(conn = %self.id, error = %e, "writer task failed");
        }
        self.close();
        let _ = watchdog.await;

        handler.on_close(self);
        Ok(())
    }

    async fn read_loop<R>(self: Arc<Self>, reader: R, handler: Arc<dyn ConnHandler>, stop: CancellationToken)
    where
        R: AsyncRead + Unpin,
    {
        let _guard = CloseGuard(&self);
        let mut reader = BufReader::with_capacity(self.config.read_buffer_size, reader);
        let mut buf = self.packer.read_buffer(self.config.read_buffer_size);
        loop {
            let body = tokio::select! {
                _ = stop.cancelled() => {
                    trace!(conn = %self.id, "reader stopped");
                    break;
                }
                res = self.read_body(&mut reader, &mut buf) => res,
            };
            let frame = match body.and_then(|body| match body {
                Some(body) => self.packer.unpack(body).map(Some),
                None => Ok(None),
            }) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(conn = %self.id, peer = ?self.peer_addr(), "peer closed connection");
                    break;
                }
                Err(e) => {
                    self.log_read_error(&e);
                    break;
                }
            };
            trace!(conn = %self.id, message_id = frame.message_id, len = frame.payload.len(), "frame received");
            handler.on_message(frame, &self);
        }
    }

    async fn read_body<R>(&self, reader: &mut R, buf: &mut ByteBuffer) -> AppResult<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        match self.config.read_timeout() {
            Some(timeout) => time::timeout(timeout, self.packer.read_frame(reader, buf))
                .await
                .map_err(|_| AppError::ReadTimeout(self.config.read_timeout_ms))?,
            None => self.packer.read_frame(reader, buf).await,
        }
    }

    fn log_read_error(&self, e: &AppError) {
        if e.is_protocol_error() {
            warn!(conn = %self.id, peer = ?self.peer_addr(), error = %e, "protocol error, closing connection");
        } else {
            debug!(conn = %self.id, peer = ?self.peer_addr(), error = %e, "read failed, closing connection");
        }
    }

    async fn write_loop<W>(self: Arc<Self>, writer: W, stop: CancellationToken)
    where
        W: AsyncWrite + Unpin,
    {
        let _guard = CloseGuard(&self);
        let mut writer = BufWriter::with_capacity(self.config.write_buffer_size, writer);
        let mut buf = self.packer.write_buffer(self.config.write_buffer_size);
        // a writer blocked on a slow socket is cancelled here as well
        tokio::select! {
            _ = stop.cancelled() => {
                trace!(conn = %self.id, "writer stopped");
            }
            res = self.drain_queues(&mut writer, &mut buf) => {
                if let Err(e) = res {
                    debug!(conn = %self.id, peer = ?self.peer_addr(), error = %e, "write failed, closing connection");
                }
            }
        }
    }

    /// Writes queued frames until a final frame has gone out.
    async fn drain_queues<W>(&self, writer: &mut BufWriter<W>, buf: &mut ByteBuffer) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let normal_rx = self.normal_rx.clone();
        let final_rx = self.final_rx.clone();
        loop {
            tokio::select! {
                biased;
                Ok(last) = final_rx.recv() => {
                    while let Ok(packed) = normal_rx.try_recv() {
                        self.write_packed(writer, buf, &packed).await?;
                    }
                    self.write_packed(writer, buf, &last).await?;
                    writer.flush().await?;
                    debug!(conn = %self.id, grace_ms = self.config.final_grace_ms, "final frame flushed");
                    time::sleep(self.config.final_grace()).await;
                    return Ok(());
                }
                Ok(packed) = normal_rx.recv() => {
                    self.write_packed(writer, buf, &packed).await?;
                    // coalesce bursts, flush once the queue runs dry
                    if normal_rx.is_empty() {
                        writer.flush().await?;
                    }
                }
            }
        }
    }

    async fn write_packed<W>(&self, writer: &mut BufWriter<W>, buf: &mut ByteBuffer, packed: &[u8]) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.packer.write_frame(packed, buf);
        let res = writer.write_all(buf.peek()).await;
        buf.reset();
        res?;
        Ok(())
    }

    async fn watch_handshake(self: Arc<Self>, stop: CancellationToken) {
        let Some(timeout) = self.config.handshake_timeout() else {
            return;
        };
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = time::sleep(timeout) => {
                if !self.is_verified() {
                    warn!(
                        conn = %self.id,
                        peer = ?self.peer_addr(),
                        timeout_ms = self.config.handshake_timeout_ms,
                        "handshake not completed in time, evicting connection"
                    );
                    self.close();
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!(conn = %self.id, "connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use rstest::{fixture, rstest};
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::network::{ConnIdGenerator, PackerConfig};
    use crate::service::setup_local_tracing;

    #[fixture]
    #[once]
    fn setup() {
        // other test modules may have installed the subscriber already
        let _ = setup_local_tracing();
    }

    #[derive(Default)]
    struct EchoHandler {
        verify_on_connect: bool,
        connects: AtomicUsize,
        closes: AtomicUsize,
        frames: Mutex<Vec<Frame>>,
    }

    impl ConnHandler for EchoHandler {
        fn on_connect(&self, conn: &Arc<Connection>) {
            if self.verify_on_connect {
                conn.mark_verified();
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, frame: Frame, conn: &Arc<Connection>) {
            conn.async_send(frame.message_id, &frame.payload);
            self.frames.lock().push(frame);
        }

        fn on_close(&self, conn: &Arc<Connection>) {
            assert!(conn.is_closed());
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connection(config: ConnectionConfig) -> Arc<Connection> {
        let packer = Packer::new(PackerConfig::default()).unwrap();
        Arc::new(Connection::new(ConnIdGenerator::new().next_id(), packer, config))
    }

    fn quick_config() -> ConnectionConfig {
        ConnectionConfig {
            handshake_timeout_ms: 0,
            final_grace_ms: 20,
            ..Default::default()
        }
    }

    /// Runs `conn` over one end of an in-memory pipe and returns the other
    /// end plus the serve task.
    fn spawn_serve(
        conn: &Arc<Connection>,
        handler: Arc<EchoHandler>,
    ) -> (DuplexStream, tokio::task::JoinHandle<AppResult<()>>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let conn = conn.clone();
        let task = tokio::spawn(async move { conn.serve_split(reader, writer, handler).await });
        (remote, task)
    }

    async fn read_frame(remote: &mut DuplexStream) -> Option<Frame> {
        let packer = Packer::new(PackerConfig::default()).unwrap();
        let mut buf = packer.read_buffer(64);
        let body = packer.read_frame(remote, &mut buf).await.unwrap()?;
        Some(packer.unpack(body).unwrap())
    }

    #[rstest]
    #[tokio::test]
    async fn test_full_queue_fails_fast_and_closes(_setup: ()) {
        let conn = connection(ConnectionConfig {
            send_queue_capacity: 4,
            ..quick_config()
        });
        let started = Instant::now();
        for i in 0..4 {
            assert!(conn.async_send(i, b"x"));
        }
        assert!(!conn.async_send(4, b"x"));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(conn.pending_sends(), 4);
        assert!(conn.is_closed());
        assert!(!conn.async_send(5, b"x"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let conn = connection(quick_config());
        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_single_final_slot() {
        let conn = connection(quick_config());
        assert!(conn.async_send_final(1, b"bye"));
        assert!(!conn.async_send_final(2, b"bye again"));
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_oversized_payload_is_rejected_without_closing() {
        let conn = connection(quick_config());
        let payload = vec![0u8; crate::network::DEFAULT_MAX_FRAME_LEN];
        assert!(!conn.async_send(1, &payload));
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_reset_restores_unstarted() {
        let conn = connection(quick_config());
        conn.mark_verified();
        conn.async_send(1, b"stale");
        conn.close();
        conn.reset().unwrap();
        assert_eq!(conn.state(), ConnState::Unstarted);
        assert!(!conn.is_verified());
        assert_eq!(conn.pending_sends(), 0);
        assert!(conn.async_send(1, b"fresh"));
    }

    #[rstest]
    #[tokio::test]
    async fn test_echo_in_order_then_peer_close(_setup: ()) {
        let conn = connection(quick_config());
        let handler = Arc::new(EchoHandler::default());
        let (mut remote, task) = spawn_serve(&conn, handler.clone());

        let packer = Packer::new(PackerConfig::default()).unwrap();
        for i in 0..3u16 {
            remote
                .write_all(&packer.encode(i, format!("msg-{}", i).as_bytes()).unwrap())
                .await
                .unwrap();
        }
        for i in 0..3u16 {
            let frame = read_frame(&mut remote).await.unwrap();
            assert_eq!(frame.message_id, i);
            assert_eq!(frame.payload, Bytes::from(format!("msg-{}", i)));
        }
        assert_eq!(conn.state(), ConnState::Open);
        assert!(conn.reset().is_err());

        drop(remote);
        task.await.unwrap().unwrap();
        assert!(conn.is_closed());
        assert_eq!(handler.connects.load(Ordering::SeqCst), 1);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
        assert_eq!(handler.frames.lock().len(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn test_serve_twice_is_rejected(_setup: ()) {
        let conn = connection(quick_config());
        let (remote, task) = spawn_serve(&conn, Arc::new(EchoHandler::default()));
        let (_other_remote, second) = spawn_serve(&conn, Arc::new(EchoHandler::default()));
        assert!(matches!(
            second.await.unwrap(),
            Err(AppError::IllegalStateError(_))
        ));
        drop(remote);
        task.await.unwrap().unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn test_protocol_error_closes_connection(_setup: ()) {
        let conn = connection(quick_config());
        let handler = Arc::new(EchoHandler::default());
        let (mut remote, task) = spawn_serve(&conn, handler.clone());

        // length far above the 2 MiB default
        remote.write_all(&[0x7f, 0, 0, 0, 0, 0]).await.unwrap();
        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
        assert!(handler.frames.lock().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_final_frame_is_flushed_after_normal_frames(_setup: ()) {
        let conn = connection(quick_config());
        assert!(conn.async_send(1, b"first"));
        assert!(conn.async_send(2, b"second"));
        assert!(conn.async_send_final(3, b"bye"));
        let (mut remote, task) = spawn_serve(&conn, Arc::new(EchoHandler::default()));

        let ids: Vec<u16> = [
            read_frame(&mut remote).await.unwrap(),
            read_frame(&mut remote).await.unwrap(),
            read_frame(&mut remote).await.unwrap(),
        ]
        .iter()
        .map(|f| f.message_id)
        .collect();
        assert_eq!(ids, vec![1, 2, 3]);

        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_unverified_connection_is_evicted(_setup: ()) {
        let conn = connection(ConnectionConfig {
            handshake_timeout_ms: 100,
            ..quick_config()
        });
        let started = Instant::now();
        let (_remote, task) = spawn_serve(&conn, Arc::new(EchoHandler::default()));
        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(conn.is_closed());
    }

    #[rstest]
    #[tokio::test]
    async fn test_verified_connection_survives_watchdog(_setup: ()) {
        let conn = connection(ConnectionConfig {
            handshake_timeout_ms: 100,
            ..quick_config()
        });
        let handler = Arc::new(EchoHandler {
            verify_on_connect: true,
            ..Default::default()
        });
        let (remote, task) = spawn_serve(&conn, handler);
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(conn.state(), ConnState::Open);

        drop(remote);
        task.await.unwrap().unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn test_read_deadline_closes_idle_verified_peer(_setup: ()) {
        let conn = connection(ConnectionConfig {
            read_timeout_ms: 100,
            ..quick_config()
        });
        let handler = Arc::new(EchoHandler {
            verify_on_connect: true,
            ..Default::default()
        });
        let started = Instant::now();
        let (_remote, task) = spawn_serve(&conn, handler.clone());
        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(conn.is_verified());
        assert!(conn.is_closed());
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_read_deadline_covers_whole_frame(_setup: ()) {
        let conn = connection(ConnectionConfig {
            read_timeout_ms: 150,
            ..quick_config()
        });
        let handler = Arc::new(EchoHandler::default());
        let started = Instant::now();
        let (mut remote, task) = spawn_serve(&conn, handler.clone());

        // a 10 byte frame, one body byte every 50ms
        let trickle = tokio::spawn(async move {
            remote.write_all(&[0, 0, 0, 10]).await?;
            for _ in 0..10 {
                time::sleep(Duration::from_millis(50)).await;
                remote.write_all(&[0]).await?;
            }
            Ok::<_, std::io::Error>(())
        });
        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(conn.is_closed());
        assert!(handler.frames.lock().is_empty());
        assert!(trickle.await.unwrap().is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn test_close_unblocks_idle_connection(_setup: ()) {
        let conn = connection(quick_config());
        let (_remote, task) = spawn_serve(&conn, Arc::new(EchoHandler::default()));
        time::sleep(Duration::from_millis(20)).await;
        assert!(conn.close());
        time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
