mod common;

use common::*;
use sparkplug_state::config::SequencePolicy;
use sparkplug_state::{NodeKey, SparkplugError};

#[tokio::test]
async fn clean_session_is_gone_after_disconnect() {
    let h = harness(SequencePolicy::Reject);
    let session = h.processor.handle_connect(connect("C1", 30, true, 0)).await;
    assert!(session.connected);
    assert_eq!(session.bd_seq, Some(0));
    assert_eq!(session.node, Some(NodeKey::new("G1", "N1")));
    assert!(h.processor.sessions().is_active("C1"));

    let closed = h.processor.handle_disconnect(disconnect("C1")).await.unwrap();
    assert!(!closed.connected);
    assert!(h.processor.sessions().get_session("C1").is_none());
    assert_eq!(h.processor.metrics().snapshot().non_compliant_sessions, 0);
}

#[tokio::test]
async fn non_clean_session_is_retained_and_reconnect_updates_bd_seq() {
    let h = harness(SequencePolicy::Reject);
    h.processor.handle_connect(connect("C1", 30, false, 6)).await;
    h.clock.advance(std::time::Duration::from_secs(4));
    h.processor.handle_disconnect(disconnect("C1")).await;

    let retained = h.processor.sessions().get_session("C1").unwrap();
    assert!(!retained.connected);
    assert_eq!(retained.disconnect_time, Some(1_700_000_004_000));
    assert_eq!(retained.bd_seq, Some(6));

    let resumed = h.processor.handle_connect(connect("C1", 30, false, 7)).await;
    assert!(resumed.connected);
    assert_eq!(h.processor.sessions().get_session("C1").unwrap().bd_seq, Some(7));
    assert_eq!(h.processor.metrics().snapshot().non_compliant_sessions, 2);
}

#[tokio::test]
async fn nonzero_session_expiry_is_reported_not_refused() {
    let h = harness(SequencePolicy::Reject);
    let mut event = connect("C1", 30, true, 0);
    event.session_expiry_secs = Some(3600);
    let session = h.processor.handle_connect(event).await;
    assert!(session.connected);
    assert_eq!(h.processor.metrics().snapshot().non_compliant_sessions, 1);
}

#[tokio::test]
async fn birth_not_matching_last_will_is_a_correlation_failure() {
    let h = harness(SequencePolicy::Reject);
    h.processor.handle_connect(connect("C1", 30, true, 3)).await;
    let err = h.processor.handle_publish(nbirth("C1", 4)).await.unwrap_err();
    assert!(err.requires_alert());
    assert!(matches!(
        err,
        SparkplugError::BirthCorrelationFailure {
            announced: 4,
            last_will: 3,
            ..
        }
    ));
    assert!(h.processor.registry().node(&NodeKey::new("G1", "N1")).is_none());
    assert_eq!(h.processor.metrics().snapshot().correlation_failures, 1);

    h.processor.handle_publish(nbirth("C1", 3)).await.unwrap();
    assert!(h.processor.registry().node(&NodeKey::new("G1", "N1")).unwrap().online);
}

#[tokio::test]
async fn explicit_death_is_recorded_against_the_session() {
    let h = harness(SequencePolicy::Reject);
    h.processor.handle_connect(connect("C1", 30, true, 0)).await;
    h.processor.handle_publish(nbirth("C1", 0)).await.unwrap();
    assert!(!h.processor.sessions().get_session("C1").unwrap().ndeath_published);
    h.processor.handle_publish(ndeath("C1", 0)).await.unwrap();
    assert!(h.processor.sessions().get_session("C1").unwrap().ndeath_published);
    assert_eq!(h.processor.metrics().snapshot().online_nodes, 0);
}
