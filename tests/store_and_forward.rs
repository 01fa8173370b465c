mod common;

use bytes::Bytes;
use common::*;
use sparkplug_state::config::{Config, SequencePolicy};
use sparkplug_state::sparkplug::{OutboundPublish, Qos};
use sparkplug_state::state::{DisconnectQueue, DrainReport, QueuedMessage};

#[tokio::test]
async fn queued_traffic_flushes_in_order_on_restore() {
    let h = harness(SequencePolicy::Reject);
    h.transport.set_offline(true);
    for topic in ["spBv1.0/G1/NCMD/N1", "spBv1.0/G1/NCMD/N2", "spBv1.0/G1/NCMD/N3"] {
        let sent = h
            .processor
            .publish_or_queue(OutboundPublish::fire_and_forget(topic.into(), Bytes::new()))
            .await;
        assert!(!sent);
    }
    assert_eq!(h.processor.queue().size(), 3);
    assert_eq!(h.processor.metrics().snapshot().queued_messages, 3);

    h.transport.set_offline(false);
    let report = h.processor.on_upstream_restored().await;
    assert_eq!(report, DrainReport { forwarded: 3, failed: 0 });
    assert_eq!(
        h.transport.topics(),
        vec![
            "spBv1.0/G1/NCMD/N1".to_string(),
            "spBv1.0/G1/NCMD/N2".to_string(),
            "spBv1.0/G1/NCMD/N3".to_string(),
        ]
    );
    assert_eq!(h.processor.queue().size(), 0);
}

#[tokio::test]
async fn drain_while_still_down_loses_the_backlog() {
    let h = harness(SequencePolicy::Reject);
    h.transport.set_offline(true);
    h.processor
        .publish_or_queue(OutboundPublish::fire_and_forget("a/b".into(), Bytes::new()))
        .await;
    let report = h.processor.on_upstream_restored().await;
    assert_eq!(report, DrainReport { forwarded: 0, failed: 1 });
    assert!(h.processor.queue().is_empty());
    assert_eq!(h.processor.metrics().snapshot().queue_forward_failures, 1);
}

#[tokio::test]
async fn configured_bound_evicts_oldest() {
    let mut config = Config::default();
    config.queue.max_messages = 2;
    let h = harness_with(config);
    h.transport.set_offline(true);
    for topic in ["t/1", "t/2", "t/3"] {
        h.processor
            .publish_or_queue(OutboundPublish::fire_and_forget(topic.into(), Bytes::new()))
            .await;
    }
    assert_eq!(h.processor.queue().size(), 2);
    assert_eq!(h.processor.metrics().snapshot().queue_evictions, 1);

    h.transport.set_offline(false);
    h.processor.on_upstream_restored().await;
    assert_eq!(h.transport.topics(), vec!["t/2".to_string(), "t/3".to_string()]);
}

#[test]
fn synchronous_drain_reports_each_item_once() {
    let queue = DisconnectQueue::new(8);
    for i in 0..4u64 {
        queue.enqueue(QueuedMessage::new(
            format!("t/{i}"),
            Bytes::from(vec![i as u8]),
            Qos::AtLeastOnce,
            i,
        ));
    }
    let mut payloads = Vec::new();
    let report = queue.drain_and_forward(|_, payload, _| {
        payloads.push(payload[0]);
        if payload[0] == 2 {
            Err("refused")
        } else {
            Ok(())
        }
    });
    assert_eq!(payloads, vec![0, 1, 2, 3]);
    assert_eq!(report, DrainReport { forwarded: 3, failed: 1 });
    assert_eq!(queue.size(), 0);
}
