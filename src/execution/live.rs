//! Table of executions currently owned by a task in this process
//!
//! Entries are added before an execution first persists an in-flight status
//! and removed when its [`LiveHandle`] drops. Each entry is a lease that
//! expires after a TTL unless renewed; owners run their work under
//! [`LiveHandle::keep_alive`], which renews the lease for as long as the work
//! is being polled. A handle leaked without that heartbeat stops pinning its
//! id once the lease runs out. The recovery sweep treats any in-flight
//! record without a live entry as orphaned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(10);

struct LiveEntry {
    token: CancellationToken,
    expires_at: Instant,
    generation: u64,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, LiveEntry>,
    next_generation: u64,
}

pub struct LiveExecutions {
    ttl: Duration,
    table: Arc<Mutex<Table>>,
}

impl LiveExecutions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            table: Arc::new(Mutex::new(Table::default())),
        }
    }

    /// Claim `id`. Returns `None` if another owner holds an unexpired entry.
    pub fn register(&self, id: &str) -> Option<LiveHandle> {
        let mut table = lock(&self.table);
        let now = Instant::now();

        if let Some(existing) = table.entries.get(id) {
            if existing.expires_at > now {
                return None;
            }
        }

        table.next_generation += 1;
        let generation = table.next_generation;
        let token = CancellationToken::new();
        table.entries.insert(
            id.to_string(),
            LiveEntry {
                token: token.clone(),
                expires_at: now + self.ttl,
                generation,
            },
        );

        Some(LiveHandle {
            id: id.to_string(),
            token,
            generation,
            ttl: self.ttl,
            table: Arc::clone(&self.table),
        })
    }

    pub fn is_live(&self, id: &str) -> bool {
        lock(&self.table)
            .entries
            .get(id)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Signal cancellation to the owner. Returns false when `id` is not live.
    pub fn cancel(&self, id: &str) -> bool {
        let table = lock(&self.table);
        match table.entries.get(id) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut table = lock(&self.table);
        let now = Instant::now();
        let before = table.entries.len();
        table.entries.retain(|_, entry| entry.expires_at > now);
        before - table.entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of one live entry; releases it on drop
pub struct LiveHandle {
    id: String,
    token: CancellationToken,
    generation: u64,
    ttl: Duration,
    table: Arc<Mutex<Table>>,
}

impl LiveHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Push the lease out by another TTL. Returns false once the entry has
    /// expired and been purged or taken over.
    pub fn renew(&self) -> bool {
        let mut table = lock(&self.table);
        match table.entries.get_mut(&self.id) {
            Some(entry) if entry.generation == self.generation => {
                entry.expires_at = Instant::now() + self.ttl;
                true
            }
            _ => false,
        }
    }

    /// Drive `work` to completion, renewing the lease at half the TTL so a
    /// long-running step never looks orphaned
    pub async fn keep_alive<F: Future>(&self, work: F) -> F::Output {
        let mut heartbeat = tokio::time::interval((self.ttl / 2).max(MIN_RENEWAL_PERIOD));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = heartbeat.tick() => {
                    if !self.renew() {
                        tracing::warn!(execution_id = %self.id, "live lease lost before renewal");
                    }
                }
            }
        }
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        // A newer owner may have re-registered the id after expiry
        if table
            .entries
            .get(&self.id)
            .map(|entry| entry.generation == self.generation)
            .unwrap_or(false)
        {
            table.entries.remove(&self.id);
        }
    }
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
