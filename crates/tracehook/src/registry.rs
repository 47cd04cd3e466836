//! Run-id keyed registry for callback-style notifications.
//!
//! Hosts that report start and end of a unit of work as separate callbacks
//! identify the unit by a run id. Entries that never see an end callback are
//! reclaimed after a TTL, and the registry never grows past `max_size`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Registrations between two periodic sweeps.
const SWEEP_EVERY: u64 = 1000;

#[derive(Debug, Clone)]
pub struct RunRegistryConfig {
    pub ttl: Duration,
    pub max_size: usize,
}

impl Default for RunRegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_size: 10_000,
        }
    }
}

impl RunRegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }
}

struct Entry<T> {
    value: T,
    registered_at: Instant,
    seq: u64,
}

struct Inner<T> {
    entries: HashMap<Uuid, Entry<T>>,
    registrations: u64,
}

/// Bounded map from run id to an in-flight value.
///
/// Evicted values are handed back to the caller instead of being dropped
/// under the lock, so finalizing them can do arbitrary work.
pub struct RunRegistry<T> {
    config: RunRegistryConfig,
    inner: Mutex<Inner<T>>,
}

impl<T> RunRegistry<T> {
    pub fn new(config: RunRegistryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                registrations: 0,
            }),
        }
    }

    pub fn config(&self) -> &RunRegistryConfig {
        &self.config
    }

    /// Register a value, returning whatever had to be evicted to make room
    /// (expired entries, then the oldest ones) plus any value previously
    /// registered under the same id.
    pub fn register(&self, run_id: Uuid, value: T) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.registrations += 1;
        let seq = inner.registrations;

        let mut evicted = Vec::new();
        if let Some(previous) = inner.entries.insert(
            run_id,
            Entry {
                value,
                registered_at: Instant::now(),
                seq,
            },
        ) {
            evicted.push(previous.value);
        }

        if inner.entries.len() > self.config.max_size || seq % SWEEP_EVERY == 0 {
            evicted.extend(self.sweep(&mut inner));
        }

        while inner.entries.len() > self.config.max_size {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, _)| *id);
            match oldest.and_then(|id| inner.entries.remove(&id)) {
                Some(entry) => evicted.push(entry.value),
                None => break,
            }
        }

        evicted
    }

    /// Read a live entry. Expired entries read as absent.
    pub fn with<R>(&self, run_id: &Uuid, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(run_id)
            .filter(|entry| entry.registered_at.elapsed() <= self.config.ttl)
            .map(|entry| f(&entry.value))
    }

    /// Take an entry out, expired or not.
    pub fn remove(&self, run_id: &Uuid) -> Option<T> {
        self.inner.lock().entries.remove(run_id).map(|e| e.value)
    }

    /// Remove and return every expired entry.
    pub fn reap_expired(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner)
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<T> {
        self.inner
            .lock()
            .entries
            .drain()
            .map(|(_, entry)| entry.value)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self, inner: &mut Inner<T>) -> Vec<T> {
        let ttl = self.config.ttl;
        let expired: Vec<Uuid> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.registered_at.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();

        expired
            .iter()
            .filter_map(|id| inner.entries.remove(id))
            .map(|entry| entry.value)
            .collect()
    }
}

impl<T> Default for RunRegistry<T> {
    fn default() -> Self {
        Self::new(RunRegistryConfig::default())
    }
}
