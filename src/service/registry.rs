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

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::network::{ConnIdGenerator, Connection, ConnectionId};

/// Live connections of one server instance.
///
/// Admission and removal happen under one short lock, only on connect and
/// disconnect, so the count never exceeds the ceiling.
#[derive(Debug)]
pub struct ConnectionRegistry {
    ids: ConnIdGenerator,
    pid: u32,
    max_connections: usize,
    live: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        let ids = ConnIdGenerator::new();
        let pid = std::process::id();
        info!(instance = %ids.instance(), pid, max_connections, "connection registry created");
        ConnectionRegistry {
            ids,
            pid,
            max_connections,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.ids.instance()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_connections
    }

    pub fn next_id(&self) -> ConnectionId {
        self.ids.next_id()
    }

    /// Admits `conn` unless the ceiling is reached.
    pub fn try_register(&self, conn: Arc<Connection>) -> bool {
        let mut live = self.live.lock();
        if live.len() >= self.max_connections {
            return false;
        }
        live.insert(conn.id().seq, conn);
        true
    }

    pub fn deregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.live.lock().remove(&id.seq);
        if removed.is_some() {
            debug!(conn = %id, "connection deregistered");
        }
        removed
    }

    pub fn get(&self, seq: u64) -> Option<Arc<Connection>> {
        self.live.lock().get(&seq).cloned()
    }

    /// Closes every live connection and returns how many there were.
    /// Entries stay registered until their tasks deregister them.
    pub fn close_all(&self) -> usize {
        let conns: Vec<Arc<Connection>> = self.live.lock().values().cloned().collect();
        for conn in &conns {
            conn.close();
        }
        conns.len()
    }
}
