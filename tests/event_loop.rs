mod common;

use common::*;
use sparkplug_state::config::Config;
use sparkplug_state::sparkplug::{ChannelTransport, JsonPayloadCodec, TransportEvent};
use sparkplug_state::time::ManualClock;
use sparkplug_state::{MessageProcessor, NodeKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn events_are_applied_in_transport_order() {
    let (transport, mut outbound) = ChannelTransport::channel(16);
    let processor = Arc::new(MessageProcessor::new(
        ManualClock::starting_at(0),
        Config::default(),
        Arc::new(transport),
        Arc::new(JsonPayloadCodec),
    ));
    let (tx, rx) = mpsc::channel(16);
    let handle = processor.clone().spawn_event_loop(rx).unwrap();

    tx.send(TransportEvent::Connect(connect("C1", 10, true, 0)))
        .await
        .unwrap();
    tx.send(TransportEvent::Publish(nbirth("C1", 0))).await.unwrap();
    tx.send(TransportEvent::Publish(ndata("C1", 1))).await.unwrap();
    tx.send(TransportEvent::Publish(ndata("C1", 7))).await.unwrap();
    tx.send(TransportEvent::Publish(ndata("C1", 2))).await.unwrap();
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let node = processor.registry().node(&NodeKey::new("G1", "N1")).unwrap();
    assert_eq!(node.seq, 2);
    let rebirth = outbound.try_recv().unwrap();
    assert_eq!(rebirth.topic, "spBv1.0/G1/NCMD/N1");
    assert!(outbound.try_recv().is_err());
}
