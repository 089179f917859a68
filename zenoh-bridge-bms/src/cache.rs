//! Last known value per device field.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::sample::Sample;

/// `(device address, field)`.
pub type CacheKey = (String, String);

/// A cached sample.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub sample: Sample,
    /// When the current value was first seen; kept while the value repeats.
    pub first_seen: Instant,
}

impl CachedValue {
    /// Age of the sample at `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.sample.acquired_at)
    }
}

/// Whether `entry` is older than `expire_after` at `now`.
///
/// Evaluated at read time; an entry turns stale without being written.
pub fn is_stale(entry: &CachedValue, now: Instant, expire_after: Duration) -> bool {
    entry.age(now) > expire_after
}

/// Concurrent map of the latest sample per `(address, field)`.
///
/// Each key has one writer, the session of its device, so arrival order wins.
/// Stale entries stay until their device is removed.
#[derive(Debug, Default)]
pub struct ValueCache {
    entries: RwLock<HashMap<CacheKey, CachedValue>>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, CachedValue>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, CachedValue>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, address: &str, field: &str) -> Option<CachedValue> {
        self.read()
            .get(&(address.to_string(), field.to_string()))
            .cloned()
    }

    /// Replace the entry for the sample's key.
    pub fn put(&self, sample: Sample) {
        insert(&mut self.write(), sample);
    }

    /// Insert a batch under one lock.
    pub fn put_all(&self, samples: impl IntoIterator<Item = Sample>) {
        let mut entries = self.write();
        for sample in samples {
            insert(&mut entries, sample);
        }
    }

    /// Drop every entry of a device. Returns how many were removed.
    pub fn remove_device(&self, address: &str) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|(addr, _), _| addr != address);
        before - entries.len()
    }

    /// All entries, sorted by address then field.
    pub fn snapshot(&self) -> Vec<CachedValue> {
        let mut values: Vec<_> = self.read().values().cloned().collect();
        values.sort_by(|a, b| {
            (&a.sample.address, &a.sample.field).cmp(&(&b.sample.address, &b.sample.field))
        });
        values
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn insert(entries: &mut HashMap<CacheKey, CachedValue>, sample: Sample) {
    let key = (sample.address.clone(), sample.field.clone());
    let first_seen = match entries.get(&key) {
        Some(prev) if prev.sample.value == sample.value => prev.first_seen,
        _ => sample.acquired_at,
    };
    entries.insert(key, CachedValue { sample, first_seen });
}
