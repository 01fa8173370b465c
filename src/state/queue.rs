//! Store-and-forward queue for outbound traffic.
//!
//! Messages that could not be delivered while the upstream link was down are
//! buffered here and flushed in order once it returns. The queue is bounded by
//! count; overflow evicts the oldest entry.
//!
//! A drain is lossy: every entry is attempted exactly once and the queue is
//! empty afterwards, whether or not the forward succeeded.

use crate::sparkplug::{OutboundPublish, Qos, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Display;

/// Outbound message waiting for the upstream link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    /// Enqueue time in unix millis.
    pub timestamp: u64,
}

impl QueuedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: Qos, timestamp: u64) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            timestamp,
        }
    }

    pub fn from_publish(publish: OutboundPublish, timestamp: u64) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            timestamp,
        }
    }

    fn into_publish(self) -> OutboundPublish {
        OutboundPublish {
            topic: self.topic,
            payload: self.payload,
            qos: self.qos,
            retain: false,
        }
    }
}

/// Outcome of a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub forwarded: usize,
    /// Entries whose forward failed; they are gone.
    pub failed: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: VecDeque<QueuedMessage>,
    dropped: u64,
}

pub struct DisconnectQueue {
    max_messages: usize,
    inner: Mutex<QueueInner>,
}

impl DisconnectQueue {
    /// A bound of zero is treated as one.
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_messages
    }

    /// Append at the tail. Returns how many of the oldest entries were evicted
    /// to stay within the bound.
    pub fn enqueue(&self, message: QueuedMessage) -> usize {
        let mut inner = self.inner.lock();
        inner.entries.push_back(message);
        let mut evicted = 0;
        while inner.entries.len() > self.max_messages {
            if let Some(oldest) = inner.entries.pop_front() {
                tracing::debug!(topic = %oldest.topic, "disconnect queue full, evicting oldest");
                evicted += 1;
            }
        }
        inner.dropped += evicted as u64;
        evicted
    }

    /// Hand each entry to `forward` in enqueue order. Failures are logged and
    /// skipped; the queue is cleared regardless.
    pub fn drain_and_forward<F, E>(&self, mut forward: F) -> DrainReport
    where
        F: FnMut(&str, &[u8], Qos) -> Result<(), E>,
        E: Display,
    {
        let entries = std::mem::take(&mut self.inner.lock().entries);
        let mut report = DrainReport::default();
        for entry in entries {
            match forward(&entry.topic, &entry.payload, entry.qos) {
                Ok(()) => report.forwarded += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(topic = %entry.topic, "queued message dropped, forward failed: {err}");
                }
            }
        }
        log_drain(&report);
        report
    }

    /// Async counterpart of [`drain_and_forward`](Self::drain_and_forward)
    /// publishing through the transport.
    pub async fn drain_to_transport(&self, transport: &dyn Transport) -> DrainReport {
        let entries = std::mem::take(&mut self.inner.lock().entries);
        let mut report = DrainReport::default();
        for entry in entries {
            let topic = entry.topic.clone();
            match transport.publish(entry.into_publish()).await {
                Ok(()) => report.forwarded += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(topic = %topic, "queued message dropped, forward failed: {err}");
                }
            }
        }
        log_drain(&report);
        report
    }

    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Total entries evicted by the bound since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

fn log_drain(report: &DrainReport) {
    if report.forwarded + report.failed > 0 {
        tracing::info!(
            forwarded = report.forwarded,
            failed = report.failed,
            "disconnect queue drained"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, ts: u64) -> QueuedMessage {
        QueuedMessage::new(topic, Bytes::from(topic.to_string()), Qos::AtLeastOnce, ts)
    }

    #[test]
    fn drain_preserves_enqueue_order() {
        let queue = DisconnectQueue::new(10);
        for (i, topic) in ["a", "b", "c"].iter().enumerate() {
            queue.enqueue(msg(topic, i as u64));
        }
        let mut seen = Vec::new();
        let report = queue.drain_and_forward(|topic, payload, qos| {
            assert_eq!(topic.as_bytes(), payload);
            assert_eq!(qos, Qos::AtLeastOnce);
            seen.push(topic.to_string());
            Ok::<_, String>(())
        });
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(report, DrainReport { forwarded: 3, failed: 0 });
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn bound_evicts_oldest_first() {
        let queue = DisconnectQueue::new(2);
        assert_eq!(queue.enqueue(msg("a", 1)), 0);
        assert_eq!(queue.enqueue(msg("b", 2)), 0);
        assert_eq!(queue.enqueue(msg("c", 3)), 1);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.dropped(), 1);

        let mut seen = Vec::new();
        queue.drain_and_forward(|topic, _, _| {
            seen.push(topic.to_string());
            Ok::<_, String>(())
        });
        assert_eq!(seen, vec!["b", "c"]);
    }

    #[test]
    fn failures_are_skipped_and_queue_still_clears() {
        let queue = DisconnectQueue::new(10);
        queue.enqueue(msg("ok-1", 1));
        queue.enqueue(msg("bad", 2));
        queue.enqueue(msg("ok-2", 3));
        let mut seen = Vec::new();
        let report = queue.drain_and_forward(|topic, _, _| {
            seen.push(topic.to_string());
            if topic == "bad" {
                Err("upstream refused")
            } else {
                Ok(())
            }
        });
        assert_eq!(seen, vec!["ok-1", "bad", "ok-2"]);
        assert_eq!(report, DrainReport { forwarded: 2, failed: 1 });
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_bound_keeps_newest_message() {
        let queue = DisconnectQueue::new(0);
        queue.enqueue(msg("a", 1));
        queue.enqueue(msg("b", 2));
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.size(), 1);
        queue.clear();
        assert!(queue.is_empty());
    }
}
