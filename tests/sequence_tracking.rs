mod common;

use common::*;
use sparkplug_state::config::SequencePolicy;
use sparkplug_state::sparkplug::{JsonPayloadCodec, MetricValue, PayloadCodec, REBIRTH_METRIC};
use sparkplug_state::{NodeKey, PublishOutcome, SparkplugError};

fn g1n1() -> NodeKey {
    NodeKey::new("G1", "N1")
}

#[tokio::test]
async fn out_of_order_data_is_rejected_and_rebirth_resets_counter() {
    let h = harness(SequencePolicy::RejectAndRebirth);
    h.processor.handle_connect(connect("C1", 10, true, 0)).await;
    h.processor.handle_publish(nbirth("C1", 0)).await.unwrap();

    assert_eq!(
        h.processor.handle_publish(ndata("C1", 1)).await.unwrap(),
        PublishOutcome::Applied
    );
    let err = h.processor.handle_publish(ndata("C1", 5)).await.unwrap_err();
    assert!(matches!(
        err,
        SparkplugError::SequenceViolation {
            expected: 2,
            received: 5,
            ..
        }
    ));
    assert_eq!(h.processor.registry().node(&g1n1()).unwrap().seq, 1);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "spBv1.0/G1/NCMD/N1");
    let command = JsonPayloadCodec.decode(&sent[0].payload).unwrap();
    assert_eq!(command.metrics[0].name.as_deref(), Some(REBIRTH_METRIC));

    assert_eq!(h.processor.rebirth().next_birth_sequence(&g1n1()), 1);
    // The edge node reconnects with its next bdSeq in the will and rebirths.
    h.processor.handle_disconnect(disconnect("C1")).await;
    h.processor.handle_connect(connect("C1", 10, true, 1)).await;
    h.processor.handle_publish(nbirth("C1", 1)).await.unwrap();
    let node = h.processor.registry().node(&g1n1()).unwrap();
    assert!(node.online);
    assert_eq!((node.bd_seq, node.seq), (1, 0));
    assert!(h.processor.handle_publish(ndata("C1", 1)).await.is_ok());
}

#[tokio::test]
async fn repeated_rejection_never_advances_the_counter() {
    let h = harness(SequencePolicy::Reject);
    h.processor.handle_publish(nbirth("C1", 0)).await.unwrap();
    for _ in 0..5 {
        assert!(h.processor.handle_publish(ndata("C1", 9)).await.is_err());
    }
    assert_eq!(h.processor.registry().node(&g1n1()).unwrap().seq, 0);
    assert!(h.processor.handle_publish(ndata("C1", 1)).await.is_ok());
    assert_eq!(h.processor.metrics().snapshot().sequence_violations, 5);
}

#[tokio::test]
async fn data_sequence_wraps_at_256() {
    let h = harness(SequencePolicy::Reject);
    h.processor.handle_publish(nbirth("C1", 0)).await.unwrap();
    for seq in 1..=255u8 {
        h.processor.handle_publish(ndata("C1", seq)).await.unwrap();
    }
    assert_eq!(h.processor.registry().node(&g1n1()).unwrap().seq, 255);
    h.processor.handle_publish(ndata("C1", 0)).await.unwrap();
    assert_eq!(h.processor.registry().node(&g1n1()).unwrap().seq, 0);
}

#[tokio::test]
async fn aliased_data_updates_named_metric() {
    let h = harness(SequencePolicy::Reject);
    h.processor.handle_publish(nbirth("C1", 0)).await.unwrap();
    h.processor.handle_publish(ndata("C1", 1)).await.unwrap();
    let node = h.processor.registry().node(&g1n1()).unwrap();
    assert_eq!(node.metrics["Temperature"].value, MetricValue::Float(21.5));
}

#[tokio::test]
async fn devices_ride_the_node_counter() {
    let h = harness(SequencePolicy::Reject);
    h.processor.handle_publish(nbirth("C1", 0)).await.unwrap();
    h.processor.handle_publish(dbirth("C1", "D1", 1)).await.unwrap();
    h.processor.handle_publish(ndata("C1", 2)).await.unwrap();
    h.processor.handle_publish(ddata("C1", "D1", 3)).await.unwrap();
    assert!(h.processor.handle_publish(ddata("C1", "D1", 3)).await.is_err());

    let device = h.processor.registry().device(&g1n1().device("D1")).unwrap();
    assert!(device.online);
    assert_eq!(device.seq, 3);
    assert_eq!(device.metrics["Pressure"].value, MetricValue::Float(1.2));
}

#[tokio::test]
async fn data_before_any_birth_is_an_unknown_entity() {
    let h = harness(SequencePolicy::RejectAndRebirth);
    assert!(matches!(
        h.processor.handle_publish(ndata("C1", 1)).await,
        Err(SparkplugError::UnknownEntity(_))
    ));
    assert_eq!(h.transport.topics(), vec!["spBv1.0/G1/NCMD/N1".to_string()]);
}

#[tokio::test]
async fn data_after_death_requires_a_new_birth() {
    let h = harness(SequencePolicy::Reject);
    h.processor.handle_publish(nbirth("C1", 4)).await.unwrap();
    h.processor.handle_publish(dbirth("C1", "D1", 1)).await.unwrap();
    h.processor.handle_publish(ndeath("C1", 4)).await.unwrap();

    assert!(h.processor.registry().online_devices(&g1n1()).is_empty());
    assert!(matches!(
        h.processor.handle_publish(ndata("C1", 2)).await,
        Err(SparkplugError::EntityOffline(_))
    ));
}

#[tokio::test]
async fn death_for_an_earlier_birth_is_ignored() {
    let h = harness(SequencePolicy::Reject);
    h.processor.handle_publish(nbirth("C1", 2)).await.unwrap();
    h.processor.handle_publish(nbirth("C1", 3)).await.unwrap();
    assert_eq!(
        h.processor.handle_publish(ndeath("C1", 2)).await.unwrap(),
        PublishOutcome::StaleDeath
    );
    assert!(h.processor.registry().node(&g1n1()).unwrap().online);
}
