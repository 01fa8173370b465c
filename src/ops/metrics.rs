//! Protocol state metrics.
//!
//! Plain atomic counters the broker process scrapes and exports however it
//! likes; nothing here formats or serves metrics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe metric updates.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for current values.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ProtocolMetrics {
    pub node_births: Counter,
    pub node_deaths: Counter,
    pub device_births: Counter,
    pub device_deaths: Counter,
    pub data_accepted: Counter,
    pub sequence_violations: Counter,
    pub correlation_failures: Counter,
    pub rebirth_requests: Counter,
    pub stale_sessions: Counter,
    pub synthetic_deaths: Counter,
    pub synthetic_death_failures: Counter,
    pub non_compliant_sessions: Counter,
    pub queue_evictions: Counter,
    pub queue_forward_failures: Counter,
    pub persistence_failures: Counter,
    pub online_nodes: Gauge,
    pub queued_messages: Gauge,
}

/// Point-in-time copy of [`ProtocolMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolMetricsSnapshot {
    pub node_births: u64,
    pub node_deaths: u64,
    pub device_births: u64,
    pub device_deaths: u64,
    pub data_accepted: u64,
    pub sequence_violations: u64,
    pub correlation_failures: u64,
    pub rebirth_requests: u64,
    pub stale_sessions: u64,
    pub synthetic_deaths: u64,
    pub synthetic_death_failures: u64,
    pub non_compliant_sessions: u64,
    pub queue_evictions: u64,
    pub queue_forward_failures: u64,
    pub persistence_failures: u64,
    pub online_nodes: u64,
    pub queued_messages: u64,
}

impl ProtocolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProtocolMetricsSnapshot {
        ProtocolMetricsSnapshot {
            node_births: self.node_births.get(),
            node_deaths: self.node_deaths.get(),
            device_births: self.device_births.get(),
            device_deaths: self.device_deaths.get(),
            data_accepted: self.data_accepted.get(),
            sequence_violations: self.sequence_violations.get(),
            correlation_failures: self.correlation_failures.get(),
            rebirth_requests: self.rebirth_requests.get(),
            stale_sessions: self.stale_sessions.get(),
            synthetic_deaths: self.synthetic_deaths.get(),
            synthetic_death_failures: self.synthetic_death_failures.get(),
            non_compliant_sessions: self.non_compliant_sessions.get(),
            queue_evictions: self.queue_evictions.get(),
            queue_forward_failures: self.queue_forward_failures.get(),
            persistence_failures: self.persistence_failures.get(),
            online_nodes: self.online_nodes.get(),
            queued_messages: self.queued_messages.get(),
        }
    }
}
