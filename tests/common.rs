//! Common test harness utilities for integration tests.
//!
//! - A recording transport that can be switched offline
//! - Payload and event builders for Sparkplug traffic
//! - A processor wired to a manual clock

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use sparkplug_state::config::{Config, SequencePolicy};
use sparkplug_state::sparkplug::{
    ConnectEvent, DisconnectEvent, JsonPayloadCodec, Metric, MetricValue, OutboundPublish,
    PayloadCodec, PublishEvent, PublishFuture, Qos, SparkplugPayload, Transport, TransportError,
};
use sparkplug_state::time::ManualClock;
use sparkplug_state::MessageProcessor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Transport that records every publish and refuses them while offline.
#[derive(Default)]
pub struct RecordingTransport {
    offline: AtomicBool,
    sent: Mutex<Vec<OutboundPublish>>,
}

impl RecordingTransport {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundPublish> {
        self.sent.lock().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.sent.lock().iter().map(|p| p.topic.clone()).collect()
    }
}

impl Transport for RecordingTransport {
    fn publish(&self, message: OutboundPublish) -> PublishFuture<'_> {
        Box::pin(async move {
            if self.offline.load(Ordering::SeqCst) {
                return Err(TransportError::Unavailable("upstream down".into()));
            }
            self.sent.lock().push(message);
            Ok(())
        })
    }
}

pub struct Harness {
    pub clock: ManualClock,
    pub transport: Arc<RecordingTransport>,
    pub processor: Arc<MessageProcessor<ManualClock>>,
}

pub fn harness(policy: SequencePolicy) -> Harness {
    let mut config = Config::default();
    config.sequence.policy = policy;
    harness_with(config)
}

pub fn harness_with(config: Config) -> Harness {
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let transport = Arc::new(RecordingTransport::default());
    let processor = Arc::new(MessageProcessor::new(
        clock.clone(),
        config,
        transport.clone(),
        Arc::new(JsonPayloadCodec),
    ));
    Harness {
        clock,
        transport,
        processor,
    }
}

pub fn encode(payload: &SparkplugPayload) -> Bytes {
    Bytes::from(JsonPayloadCodec.encode(payload).unwrap())
}

pub fn bd_seq_metric(bd_seq: u8) -> Metric {
    Metric::named("bdSeq", MetricValue::UInt(u64::from(bd_seq)))
}

pub fn publish(client_id: &str, topic: &str, payload: &SparkplugPayload) -> PublishEvent {
    PublishEvent {
        client_id: client_id.into(),
        topic: topic.into(),
        payload: encode(payload),
        qos: Qos::AtMostOnce,
        retain: false,
    }
}

pub fn nbirth(client_id: &str, bd_seq: u8) -> PublishEvent {
    publish(
        client_id,
        "spBv1.0/G1/NBIRTH/N1",
        &SparkplugPayload::new(1)
            .with_seq(0)
            .with_metric(bd_seq_metric(bd_seq))
            .with_metric(Metric::named("Temperature", MetricValue::Float(20.0)).with_alias(1)),
    )
}

pub fn ndeath(client_id: &str, bd_seq: u8) -> PublishEvent {
    publish(
        client_id,
        "spBv1.0/G1/NDEATH/N1",
        &SparkplugPayload::new(1).with_metric(bd_seq_metric(bd_seq)),
    )
}

pub fn ndata(client_id: &str, seq: u8) -> PublishEvent {
    publish(
        client_id,
        "spBv1.0/G1/NDATA/N1",
        &SparkplugPayload::new(2)
            .with_seq(seq)
            .with_metric(Metric::aliased(1, MetricValue::Float(21.5))),
    )
}

pub fn dbirth(client_id: &str, device: &str, seq: u8) -> PublishEvent {
    publish(
        client_id,
        &format!("spBv1.0/G1/DBIRTH/N1/{device}"),
        &SparkplugPayload::new(3)
            .with_seq(seq)
            .with_metric(Metric::named("Pressure", MetricValue::Float(1.0))),
    )
}

pub fn ddata(client_id: &str, device: &str, seq: u8) -> PublishEvent {
    publish(
        client_id,
        &format!("spBv1.0/G1/DDATA/N1/{device}"),
        &SparkplugPayload::new(4)
            .with_seq(seq)
            .with_metric(Metric::named("Pressure", MetricValue::Float(1.2))),
    )
}

/// CONNECT for an edge node registering an NDEATH last will carrying `bd_seq`.
pub fn connect(client_id: &str, keep_alive_secs: u16, clean_session: bool, bd_seq: u8) -> ConnectEvent {
    ConnectEvent {
        client_id: client_id.into(),
        clean_session,
        keep_alive_secs,
        session_expiry_secs: Some(0),
        will_topic: Some("spBv1.0/G1/NDEATH/N1".into()),
        will_payload: Some(encode(
            &SparkplugPayload::new(0).with_metric(bd_seq_metric(bd_seq)),
        )),
    }
}

pub fn disconnect(client_id: &str) -> DisconnectEvent {
    DisconnectEvent {
        client_id: client_id.into(),
    }
}
