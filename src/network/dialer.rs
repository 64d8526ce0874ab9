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

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

use super::{ConnHandler, ConnIdGenerator, ConnState, Connection, ConnectionConfig, Packer};
use crate::{AppError, AppResult};

/// Outbound side of the transport.
///
/// A client owns exactly one [`Connection`] for its whole life. Every
/// [`Client::dial`] after the first resets that connection and runs it over
/// a fresh socket, so its queues are allocated once.
pub struct Client {
    conn: Arc<Connection>,
    handler: Arc<dyn ConnHandler>,
    config: ConnectionConfig,
    session: Option<JoinHandle<()>>,
}

impl Client {
    pub fn new(packer: Packer, config: ConnectionConfig, handler: Arc<dyn ConnHandler>) -> Client {
        let id = ConnIdGenerator::new().next_id();
        Client {
            conn: Arc::new(Connection::new(id, packer, config.clone())),
            handler,
            config,
            session: None,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_finished())
    }

    /// Connects to `addr` and starts the connection's reader and writer.
    ///
    /// Fails if a previous session is still running.
    pub async fn dial(&mut self, addr: &str) -> AppResult<Arc<Connection>> {
        if let Some(session) = self.session.take() {
            if !session.is_finished() {
                self.session = Some(session);
                return Err(AppError::IllegalStateError(format!(
                    "client {} is still connected",
                    self.conn.id()
                )));
            }
            let _ = session.await;
        }
        if self.conn.state() != ConnState::Unstarted {
            self.conn.reset()?;
        }

        let stream = time::timeout(self.config.dial_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| {
                AppError::DetailedIoError(format!(
                    "dial {} timed out after {}ms",
                    addr, self.config.dial_timeout_ms
                ))
            })??;
        stream.set_nodelay(true)?;
        info!(conn = %self.conn.id(), addr, "dialed");

        let conn = self.conn.clone();
        let handler = self.handler.clone();
        self.session = Some(tokio::spawn(async move {
            if let Err(err) = conn.serve(stream, handler).await {
                error!(conn = %conn.id(), error = %err, "client session failed");
            }
        }));
        Ok(self.conn.clone())
    }

    /// Returns the connection to `Unstarted` without dialing.
    ///
    /// Fails while the session task is still running, even if the
    /// connection already reports `Closed`.
    pub fn reset(&self) -> AppResult<()> {
        if self.is_connected() {
            return Err(AppError::IllegalStateError(format!(
                "client {} session is still running",
                self.conn.id()
            )));
        }
        self.conn.reset()
    }

    /// Closes the connection and waits until its session has finished.
    pub async fn close(&mut self) {
        self.conn.close();
        if let Some(session) = self.session.take() {
            let _ = session.await;
        }
        debug!(conn = %self.conn.id(), "client closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::network::{Frame, PackerConfig};

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Frame>>,
        closes: AtomicUsize,
    }

    impl ConnHandler for Recorder {
        fn on_connect(&self, _conn: &Arc<Connection>) {}

        fn on_message(&self, frame: Frame, _conn: &Arc<Connection>) {
            self.frames.lock().push(frame);
        }

        fn on_close(&self, _conn: &Arc<Connection>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn client(handler: Arc<Recorder>) -> Client {
        let config = ConnectionConfig {
            handshake_timeout_ms: 0,
            ..Default::default()
        };
        Client::new(Packer::new(PackerConfig::default()).unwrap(), config, handler)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(2), async {
            while !cond() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_redial_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let packer = Packer::new(PackerConfig::default()).unwrap();

        let handler = Arc::new(Recorder::default());
        let mut client = client(handler.clone());
        let first = client.dial(&addr).await.unwrap();
        assert!(client.dial(&addr).await.is_err());

        // server greets, then hangs up
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&packer.encode(9, b"hello").unwrap()).await.unwrap();
        drop(socket);
        wait_for(|| handler.closes.load(Ordering::SeqCst) == 1).await;
        wait_for(|| !client.is_connected()).await;
        assert_eq!(handler.frames.lock()[0], Frame::new(9, Bytes::from_static(b"hello")));

        let second = client.dial(&addr).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let (mut socket, _) = listener.accept().await.unwrap();
        assert!(second.async_send(1, b"again"));
        let mut buf = packer.read_buffer(16);
        let body = packer.read_frame(&mut socket, &mut buf).await.unwrap().unwrap();
        assert_eq!(packer.unpack(body).unwrap(), Frame::new(1, Bytes::from_static(b"again")));

        client.close().await;
        assert!(!client.is_connected());
        assert_eq!(handler.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_waits_for_session_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handler = Arc::new(Recorder::default());
        let mut client = client(handler.clone());
        let conn = client.dial(&addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();

        // closed but the session has not wound down yet
        conn.close();
        assert!(client.reset().is_err());
        assert_eq!(conn.state(), ConnState::Closed);

        drop(socket);
        wait_for(|| !client.is_connected()).await;
        client.reset().unwrap();
        assert_eq!(conn.state(), ConnState::Unstarted);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let mut client = client(Arc::new(Recorder::default()));
        assert!(client.dial(&addr).await.is_err());
        assert!(!client.is_connected());
    }
}
