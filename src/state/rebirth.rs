//! Rebirth coordination: next `bdSeq`, last-will correlation and rebirth requests.

use super::{registry::EntityRegistry, EntityKey, NodeKey};
use crate::error::{Result, SparkplugError};
use crate::sparkplug::{
    MessageType, OutboundPublish, PayloadCodec, SparkplugPayload, SparkplugTopicParser,
};
use crate::time::Clock;
use std::sync::Arc;

pub struct RebirthCoordinator<C: Clock> {
    registry: Arc<EntityRegistry<C>>,
    clock: C,
}

impl<C: Clock> RebirthCoordinator<C> {
    pub fn new(registry: Arc<EntityRegistry<C>>, clock: C) -> Self {
        Self { registry, clock }
    }

    /// 0 for a node never seen, otherwise the 8-bit successor of its `bdSeq`.
    pub fn next_birth_sequence(&self, key: &NodeKey) -> u8 {
        self.registry
            .node(key)
            .map(|node| node.bd_seq.wrapping_add(1))
            .unwrap_or(0)
    }

    /// Advance the node to its next birth in the registry and return the new `bdSeq`.
    ///
    /// The caller transmits the birth carrying the returned value.
    pub fn complete_rebirth(&self, key: &NodeKey, prior_bd_seq: u8) -> u8 {
        let next = self.next_birth_sequence(key);
        let node = self.registry.apply_node_birth(key, next, &[]);
        tracing::info!(
            node = %key,
            prior_bd_seq,
            bd_seq = node.bd_seq,
            "rebirth completed"
        );
        next
    }

    /// A rebirth is trustworthy only if it announces the value the previous
    /// session registered in its last will.
    pub fn correlate(announced_bd_seq: u8, last_will_bd_seq: u8) -> bool {
        announced_bd_seq == last_will_bd_seq
    }

    /// [`correlate`](Self::correlate) surfaced as a hard failure.
    pub fn verify_rebirth(
        &self,
        key: &NodeKey,
        announced_bd_seq: u8,
        last_will_bd_seq: u8,
    ) -> Result<()> {
        if Self::correlate(announced_bd_seq, last_will_bd_seq) {
            return Ok(());
        }
        tracing::error!(
            node = %key,
            announced_bd_seq,
            last_will_bd_seq,
            "birth does not match last will; conflicting live session suspected"
        );
        Err(SparkplugError::BirthCorrelationFailure {
            entity: EntityKey::Node(key.clone()),
            announced: announced_bd_seq,
            last_will: last_will_bd_seq,
        })
    }

    /// NCMD publish asking the edge node to send a fresh NBIRTH.
    pub fn rebirth_request(
        &self,
        topics: &SparkplugTopicParser,
        codec: &dyn PayloadCodec,
        key: &NodeKey,
    ) -> Result<OutboundPublish> {
        let payload = codec.encode(&SparkplugPayload::rebirth_command(self.clock.unix_millis()))?;
        let topic = topics.node_topic(&key.group_id, MessageType::NCmd, &key.edge_node_id);
        Ok(OutboundPublish::fire_and_forget(topic, payload))
    }
}
