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

use std::future::Future;
use std::sync::Arc;

use tokio::{runtime, signal};
use tracing::{error, info};

use super::{ConnectionRegistry, Server, ServerConfig};
use crate::network::ConnHandler;
use crate::AppResult;

/// Process-level runner: owns the runtime, serves until Ctrl-C, then shuts
/// the server down.
pub struct Gateway {
    config: ServerConfig,
}

impl Gateway {
    pub fn new(config: ServerConfig) -> Self {
        Gateway { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn start(&self, handler: Arc<dyn ConnHandler>) -> AppResult<()> {
        let worker_threads = self.config.runtime.worker_threads();
        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("gamewire-worker")
            .enable_all()
            .build()?;
        info!(worker_threads, "runtime started");

        rt.block_on(self.run_until(handler, async {
            if let Err(err) = signal::ctrl_c().await {
                error!("listen for ctrl-c failed: {}", err);
            }
        }))
    }

    /// Serves until `stop_signal` resolves or the server stops on its own,
    /// then closes the server and waits for every connection to finish.
    pub async fn run_until<F>(&self, handler: Arc<dyn ConnHandler>, stop_signal: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let registry = Arc::new(ConnectionRegistry::new(self.config.network.max_connection));
        let server = Arc::new(Server::listen(&self.config, registry, handler).await?);

        let mut runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        tokio::select! {
            res = &mut runner => {
                match res {
                    Ok(Err(err)) => error!(cause = %err, "tcp server failed"),
                    Err(err) => error!(cause = %err, "tcp server task failed"),
                    Ok(Ok(())) => {}
                }
            }
            _ = stop_signal => {
                info!("get shutdown signal");
            }
        }

        server.close().await;
        info!("gateway shutdown complete");
        Ok(())
    }
}
