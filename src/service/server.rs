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
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::config::{NetworkConfig, ServerConfig};
use super::{ConnectionRegistry, Shutdown};
use crate::network::{ConnHandler, Connection, ConnectionConfig, Packer};
use crate::{AppError, AppResult};

/// Listening socket plus the shutdown receiver, handed to `run` once.
struct Acceptor {
    listener: TcpListener,
    shutdown: Shutdown,
}

/// Accepts client sockets and runs each one as a [`Connection`].
///
/// Sockets beyond the registry ceiling are closed right after accept,
/// without the handler ever seeing them.
pub struct Server {
    acceptor: Mutex<Option<Acceptor>>,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnHandler>,
    packer: Packer,
    network: NetworkConfig,
    connection: ConnectionConfig,
    notify_shutdown: broadcast::Sender<()>,
    stopped: watch::Sender<bool>,
}

impl Server {
    pub async fn listen(
        config: &ServerConfig,
        registry: Arc<ConnectionRegistry>,
        handler: Arc<dyn ConnHandler>,
    ) -> AppResult<Server> {
        let packer = Packer::new(config.packer.clone())?;
        let listen_address = config.network.listen_address();
        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, err
            );
            error!("{}", error_msg);
            AppError::DetailedIoError(error_msg)
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        let (notify_shutdown, _) = broadcast::channel(1);
        let shutdown = Shutdown::subscribe(&notify_shutdown);
        let (stopped, _) = watch::channel(false);
        Ok(Server {
            acceptor: Mutex::new(Some(Acceptor { listener, shutdown })),
            local_addr,
            registry,
            handler,
            packer,
            network: config.network.clone(),
            connection: config.connection.clone(),
            notify_shutdown,
            stopped,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs the accept loop until [`Server::close`] is called.
    ///
    /// Shutdown sequence:
    /// 1. the accept loop stops and the listening socket is dropped, so no
    ///    new connections come in.
    /// 2. every live connection is closed.
    /// 3. every connection task is joined, `on_close` included.
    #[tracing::instrument(skip_all, fields(addr = %self.local_addr))]
    pub async fn run(&self) -> AppResult<()> {
        let Acceptor {
            listener,
            mut shutdown,
        } = self.acceptor.lock().take().ok_or_else(|| {
            AppError::IllegalStateError("server is already running or closed".to_string())
        })?;
        let mut tasks = JoinSet::new();
        let mut backoff = self.network.accept_backoff_min();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = res {
                        error!("connection task failed: {}", err);
                    }
                }
                res = listener.accept() => match res {
                    Ok((socket, peer)) => {
                        backoff = self.network.accept_backoff_min();
                        self.admit(socket, peer, &mut tasks);
                    }
                    Err(err) => {
                        warn!(backoff_ms = backoff.as_millis() as u64, "accept failed: {}", err);
                        tokio::select! {
                            _ = shutdown.recv() => {
                                debug!("accept loop received shutdown signal during backoff");
                                break;
                            }
                            _ = time::sleep(backoff) => {}
                        }
                        backoff = next_backoff(backoff, self.network.accept_backoff_max());
                    }
                },
            }
        }

        drop(listener);
        let closing = self.registry.close_all();
        info!(closing, "listener closed, waiting for connections to finish");
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!("connection task failed: {}", err);
            }
        }
        self.stopped.send_replace(true);
        info!("tcp server stopped");
        Ok(())
    }

    fn admit(&self, socket: TcpStream, peer: SocketAddr, tasks: &mut JoinSet<()>) {
        if self.registry.is_full() {
            debug!(%peer, limit = self.registry.capacity(), "connection limit reached, rejecting");
            return;
        }
        if self.network.tcp_nodelay {
            if let Err(err) = socket.set_nodelay(true) {
                warn!(%peer, "set TCP_NODELAY failed: {}", err);
            }
        }
        let conn = Arc::new(Connection::new(
            self.registry.next_id(),
            self.packer.clone(),
            self.connection.clone(),
        ));
        if !self.registry.try_register(conn.clone()) {
            debug!(%peer, limit = self.registry.capacity(), "connection limit reached, rejecting");
            return;
        }
        debug!(conn = %conn.id(), %peer, "accept new connection");

        let registry = self.registry.clone();
        let handler = self.handler.clone();
        tasks.spawn(async move {
            if let Err(err) = conn.serve(socket, handler).await {
                error!(conn = %conn.id(), "Connection error: {:?}", err);
            }
            // whether gracefully or unexpectedly closed, release the slot
            registry.deregister(conn.id());
        });
    }

    /// Stops accepting, closes every connection and waits until all
    /// connection tasks have exited.
    pub async fn close(&self) {
        if self.acceptor.lock().take().is_some() {
            // never ran, dropping the acceptor closes the socket
            self.stopped.send_replace(true);
            return;
        }
        let _ = self.notify_shutdown.send(());
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

/// Delay before the next accept retry: doubles, capped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
