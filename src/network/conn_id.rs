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

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Identity of one connection: the instance that created it plus a
/// per-instance sequence number. Unique for the lifetime of the instance
/// no matter how many connections churn through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub instance: Uuid,
    pub seq: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.instance.simple(), self.seq)
    }
}

#[derive(Debug)]
pub struct ConnIdGenerator {
    instance: Uuid,
    next_seq: AtomicU64,
}

impl Default for ConnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnIdGenerator {
    pub fn new() -> Self {
        ConnIdGenerator {
            instance: Uuid::new_v4(),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId {
            instance: self.instance,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_ids_are_unique_across_threads() {
        let generator = Arc::new(ConnIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..1000).map(|_| generator.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert_eq!(id.instance, generator.instance());
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_instances_differ() {
        let a = ConnIdGenerator::new().next_id();
        let b = ConnIdGenerator::new().next_id();
        assert_eq!(a.seq, b.seq);
        assert_ne!(a, b);
        assert!(a.to_string().ends_with("-1"));
    }
}
