//! In-process [`StateStore`] with TTL expiry.

use super::{StateStore, StoreFuture};
use crate::time::{Clock, SystemClock};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

pub struct MemoryStateStore<C: Clock = SystemClock> {
    clock: C,
    records: RwLock<BTreeMap<String, Record>>,
}

impl MemoryStateStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStateStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryStateStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Drop expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| record.is_live(now));
        before - records.len()
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.records.read().values().filter(|r| r.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Clock> StateStore for MemoryStateStore<C> {
    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: Option<Duration>) -> StoreFuture<'a, ()> {
        // A deadline past the end of the clock never expires.
        let expires_at = ttl.and_then(|ttl| self.clock.now().checked_add(ttl));
        self.records
            .write()
            .insert(key.to_string(), Record { value, expires_at });
        Box::pin(async { Ok(()) })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        let now = self.clock.now();
        let value = self
            .records
            .read()
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.value.clone());
        Box::pin(async move { Ok(value) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        self.records.write().remove(key);
        Box::pin(async { Ok(()) })
    }

    fn scan_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        let now = self.clock.now();
        let keys = self
            .records
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, record)| record.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        Box::pin(async move { Ok(keys) })
    }
}
