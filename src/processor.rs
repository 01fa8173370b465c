//! Message processor: drives the protocol state from transport events.
//!
//! Every inbound event flows through here. Topics are parsed, payloads
//! decoded, then the registry, rebirth coordinator and session manager are
//! updated in that order. Outbound protocol traffic (rebirth requests) goes
//! through the transport and falls back to the disconnect queue when the
//! transport refuses it. Checkpoints are best-effort: a store failure is
//! logged and counted, never returned.

use crate::config::{Config, SequencePolicy};
use crate::error::{Result, SparkplugError};
use crate::ops::metrics::ProtocolMetrics;
use crate::sparkplug::{
    ConnectEvent, DisconnectEvent, MessageType, OutboundPublish, PayloadCodec, PublishEvent,
    SparkplugPayload, SparkplugTopicParser, TopicInfo, TopicParser, Transport, TransportEvent,
};
use crate::state::registry::SequenceCheck;
use crate::state::session::{SessionOpen, SessionState};
use crate::state::{
    DeviceKey, DisconnectQueue, DrainReport, EntityKey, EntityRegistry, NodeKey, QueuedMessage,
    RebirthCoordinator, SessionManager, StaleSessionMonitor,
};
use crate::store::{StatePersistence, StoreError};
use crate::time::Clock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened to an inbound publish that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// State was updated.
    Applied,
    /// A death for an earlier birth; the current birth stays online.
    StaleDeath,
    /// Outside the tracked namespace, or a message type with no state (commands, STATE).
    Ignored,
}

pub struct MessageProcessor<C: Clock> {
    clock: C,
    config: Config,
    registry: Arc<EntityRegistry<C>>,
    sessions: Arc<SessionManager<C>>,
    rebirth: RebirthCoordinator<C>,
    queue: Arc<DisconnectQueue>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PayloadCodec>,
    parser: Arc<dyn TopicParser>,
    topics: SparkplugTopicParser,
    persistence: Option<Arc<StatePersistence>>,
    metrics: Arc<ProtocolMetrics>,
    rebirths_requested: Mutex<HashMap<NodeKey, Instant>>,
}

impl<C: Clock> MessageProcessor<C> {
    pub fn new(
        clock: C,
        config: Config,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn PayloadCodec>,
    ) -> Self {
        let registry = Arc::new(EntityRegistry::new(clock.clone()));
        let sessions = Arc::new(SessionManager::new(clock.clone()));
        let topics = SparkplugTopicParser::new(config.namespace.clone());
        Self {
            rebirth: RebirthCoordinator::new(registry.clone(), clock.clone()),
            queue: Arc::new(DisconnectQueue::new(config.queue.max_messages)),
            parser: Arc::new(topics.clone()),
            topics,
            clock,
            config,
            registry,
            sessions,
            transport,
            codec,
            persistence: None,
            metrics: Arc::new(ProtocolMetrics::new()),
            rebirths_requested: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the default `spBv1.0` parser with another topic-namespace collaborator.
    pub fn with_topic_parser(mut self, parser: Arc<dyn TopicParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ProtocolMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &Arc<EntityRegistry<C>> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager<C>> {
        &self.sessions
    }

    pub fn queue(&self) -> &Arc<DisconnectQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<ProtocolMetrics> {
        &self.metrics
    }

    pub fn rebirth(&self) -> &RebirthCoordinator<C> {
        &self.rebirth
    }

    /// Stale-session monitor sharing this processor's registry, sessions and transport.
    pub fn stale_monitor(&self) -> StaleSessionMonitor<C> {
        StaleSessionMonitor::new(
            self.clock.clone(),
            self.config.monitor.clone(),
            self.sessions.clone(),
            self.registry.clone(),
            self.transport.clone(),
            self.codec.clone(),
            self.topics.clone(),
            self.metrics.clone(),
        )
    }

    /// Seed the registry and sessions from the checkpoint store, if one is configured.
    pub async fn restore(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        persistence.restore(&self.registry, &self.sessions).await?;
        self.refresh_online_gauge();
        Ok(())
    }

    pub async fn handle_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Connect(connect) => {
                self.handle_connect(connect).await;
                Ok(())
            }
            TransportEvent::Disconnect(disconnect) => {
                self.handle_disconnect(disconnect).await;
                Ok(())
            }
            TransportEvent::Publish(publish) => self.handle_publish(publish).await.map(|_| ()),
            TransportEvent::UpstreamRestored => {
                self.on_upstream_restored().await;
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    pub async fn handle_connect(&self, connect: ConnectEvent) -> SessionState {
        let mut compliant = connect.clean_session;
        if let Some(expiry) = connect.session_expiry_secs {
            compliant &= SessionManager::<C>::validate_session_expiry(expiry);
        }
        if !compliant {
            self.metrics.non_compliant_sessions.inc();
        }

        let mut open = SessionOpen::new(connect.client_id, connect.clean_session)
            .with_keep_alive(connect.keep_alive_secs);
        if let Some(will_topic) = connect.will_topic {
            let will_bd_seq = connect
                .will_payload
                .as_deref()
                .and_then(|bytes| self.will_bd_seq(&open.client_id, bytes));
            if let Some(node) = self.will_node(&will_topic) {
                open = open.with_node(node);
            }
            open = open.with_last_will(will_topic, will_bd_seq);
        }

        let session = self.sessions.open_session(open);
        tracing::info!(
            client_id = %session.client_id,
            clean_session = session.clean_session,
            keep_alive = session.keep_alive_secs,
            bd_seq = ?session.bd_seq,
            "session opened"
        );
        if let Some(persistence) = &self.persistence {
            self.checkpoint("session", persistence.save_session(&session).await);
        }
        session
    }

    pub async fn handle_disconnect(&self, disconnect: DisconnectEvent) -> Option<SessionState> {
        let Some(session) = self.sessions.close_session(&disconnect.client_id) else {
            tracing::debug!(client_id = %disconnect.client_id, "disconnect for unknown session");
            return None;
        };
        tracing::info!(
            client_id = %session.client_id,
            retained = !session.clean_session,
            "session closed"
        );
        if let Some(persistence) = &self.persistence {
            let result = if session.clean_session {
                persistence.remove_session(&session.client_id).await
            } else {
                persistence.save_session(&session).await
            };
            self.checkpoint("session", result);
        }
        Some(session)
    }

    fn will_bd_seq(&self, client_id: &str, bytes: &[u8]) -> Option<u8> {
        match self.codec.decode(bytes) {
            Ok(payload) => payload.bd_seq(),
            Err(err) => {
                tracing::warn!(client_id, "last-will payload not decodable: {err}");
                None
            }
        }
    }

    fn will_node(&self, will_topic: &str) -> Option<NodeKey> {
        let info = self.parser.parse(will_topic);
        (info.is_valid && info.message_type == Some(MessageType::NDeath))
            .then(|| NodeKey::new(info.group_id, info.edge_node_id))
    }

    // -----------------------------------------------------------------------
    // Publishes
    // -----------------------------------------------------------------------

    pub async fn handle_publish(&self, publish: PublishEvent) -> Result<PublishOutcome> {
        self.sessions.record_activity(&publish.client_id);

        let info = self.parser.parse(&publish.topic);
        if info.namespace != self.topics.namespace() {
            return Ok(PublishOutcome::Ignored);
        }
        let Some(kind) = info.message_type.filter(|_| info.is_valid) else {
            return Err(SparkplugError::InvalidTopic(publish.topic));
        };
        if matches!(kind, MessageType::NCmd | MessageType::DCmd | MessageType::State) {
            return Ok(PublishOutcome::Ignored);
        }

        let payload = self.codec.decode(&publish.payload)?;
        match kind {
            MessageType::NBirth => self.on_node_birth(&publish, &info, &payload).await,
            MessageType::NDeath => self.on_node_death(&publish, &info, &payload).await,
            MessageType::NData => self.on_node_data(&publish, &info, &payload).await,
            MessageType::DBirth => self.on_device_birth(&publish, &info, &payload).await,
            MessageType::DDeath => self.on_device_death(&publish, &info, &payload).await,
            MessageType::DData => self.on_device_data(&publish, &info, &payload).await,
            MessageType::NCmd | MessageType::DCmd | MessageType::State => {
                Ok(PublishOutcome::Ignored)
            }
        }
    }

    async fn on_node_birth(
        &self,
        publish: &PublishEvent,
        info: &TopicInfo,
        payload: &SparkplugPayload,
    ) -> Result<PublishOutcome> {
        let key = node_key(info);
        let bd_seq = require_bd_seq(MessageType::NBirth, publish, payload)?;

        match self
            .sessions
            .get_session(&publish.client_id)
            .and_then(|session| session.bd_seq)
        {
            Some(last_will) => {
                if let Err(err) = self.rebirth.verify_rebirth(&key, bd_seq, last_will) {
                    self.metrics.correlation_failures.inc();
                    return Err(err);
                }
            }
            None => tracing::warn!(
                node = %key,
                client_id = %publish.client_id,
                bd_seq,
                "birth without a last-will bdSeq to correlate against"
            ),
        }
        if payload.seq_u8().is_some_and(|seq| seq != 0) {
            tracing::warn!(node = %key, seq = ?payload.seq, "birth carries nonzero seq; counter reset to 0");
        }

        let first_contact = self.registry.node(&key).is_none();
        let node = self.registry.apply_node_birth(&key, bd_seq, &payload.metrics);
        let devices = self.registry.mark_node_devices_offline(&key);
        self.sessions.bind_node(&publish.client_id, key.clone());
        self.rebirths_requested.lock().remove(&key);
        self.metrics.node_births.inc();
        self.refresh_online_gauge();
        tracing::info!(
            node = %key,
            client_id = %publish.client_id,
            bd_seq,
            first_contact,
            devices_reset = devices,
            metrics = node.metrics.len(),
            "node birth"
        );

        if let Some(persistence) = &self.persistence {
            self.checkpoint("node", persistence.save_node(&node).await);
            self.checkpoint(
                "birth",
                persistence
                    .save_birth(MessageType::NBirth, &key, None, &publish.payload)
                    .await,
            );
        }
        Ok(PublishOutcome::Applied)
    }

    async fn on_node_death(
        &self,
        publish: &PublishEvent,
        info: &TopicInfo,
        payload: &SparkplugPayload,
    ) -> Result<PublishOutcome> {
        let key = node_key(info);
        let bd_seq = require_bd_seq(MessageType::NDeath, publish, payload)?;
        if !self.registry.mark_offline_for_birth(&key, bd_seq)? {
            tracing::debug!(node = %key, bd_seq, "death for an earlier birth ignored");
            return Ok(PublishOutcome::StaleDeath);
        }
        let devices = self.registry.mark_node_devices_offline(&key);
        self.sessions.mark_death_published(&key);
        self.metrics.node_deaths.inc();
        self.refresh_online_gauge();
        tracing::info!(node = %key, bd_seq, devices, "node death");
        self.checkpoint_node(&key).await;
        Ok(PublishOutcome::Applied)
    }

    async fn on_node_data(
        &self,
        publish: &PublishEvent,
        info: &TopicInfo,
        payload: &SparkplugPayload,
    ) -> Result<PublishOutcome> {
        let key = node_key(info);
        let seq = require_seq(MessageType::NData, publish, payload)?;
        self.admit_sequence(&EntityKey::Node(key.clone()), seq).await?;
        self.registry.update_node_metrics(&key, &payload.metrics)?;
        self.metrics.data_accepted.inc();
        self.checkpoint_node(&key).await;
        Ok(PublishOutcome::Applied)
    }

    async fn on_device_birth(
        &self,
        publish: &PublishEvent,
        info: &TopicInfo,
        payload: &SparkplugPayload,
    ) -> Result<PublishOutcome> {
        let key = device_key(info);
        let seq = require_seq(MessageType::DBirth, publish, payload)?;
        self.admit_sequence(&EntityKey::Device(key.clone()), seq).await?;
        let device = self.registry.apply_device_birth(&key, seq, &payload.metrics)?;
        self.metrics.device_births.inc();
        tracing::info!(device = %key, seq, metrics = device.metrics.len(), "device birth");

        if let Some(persistence) = &self.persistence {
            self.checkpoint("device", persistence.save_device(&device).await);
            self.checkpoint(
                "birth",
                persistence
                    .save_birth(
                        MessageType::DBirth,
                        &key.node(),
                        Some(&key.device_id),
                        &publish.payload,
                    )
                    .await,
            );
        }
        self.checkpoint_node(&key.node()).await;
        Ok(PublishOutcome::Applied)
    }

    async fn on_device_death(
        &self,
        publish: &PublishEvent,
        info: &TopicInfo,
        payload: &SparkplugPayload,
    ) -> Result<PublishOutcome> {
        let key = device_key(info);
        let seq = require_seq(MessageType::DDeath, publish, payload)?;
        self.admit_sequence(&EntityKey::Device(key.clone()), seq).await?;
        let device = self.registry.mark_device_offline(&key)?;
        self.metrics.device_deaths.inc();
        tracing::info!(device = %key, seq, "device death");
        if let Some(persistence) = &self.persistence {
            self.checkpoint("device", persistence.save_device(&device).await);
        }
        self.checkpoint_node(&key.node()).await;
        Ok(PublishOutcome::Applied)
    }

    async fn on_device_data(
        &self,
        publish: &PublishEvent,
        info: &TopicInfo,
        payload: &SparkplugPayload,
    ) -> Result<PublishOutcome> {
        let key = device_key(info);
        let seq = require_seq(MessageType::DData, publish, payload)?;
        self.admit_sequence(&EntityKey::Device(key.clone()), seq).await?;
        self.registry.update_device_metrics(&key, &payload.metrics)?;
        self.metrics.data_accepted.inc();
        if let (Some(persistence), Some(device)) = (&self.persistence, self.registry.device(&key)) {
            self.checkpoint("device", persistence.save_device(&device).await);
        }
        self.checkpoint_node(&key.node()).await;
        Ok(PublishOutcome::Applied)
    }

    /// Validate `seq` against the owning node's counter and apply the
    /// configured policy to anything out of order. `Ok` means the message
    /// should be applied.
    async fn admit_sequence(&self, entity: &EntityKey, seq: u8) -> Result<()> {
        let node = match entity {
            EntityKey::Node(key) => key.clone(),
            EntityKey::Device(key) => key.node(),
        };
        let checked = match entity {
            EntityKey::Node(key) => self.registry.check_data_sequence(key, seq),
            EntityKey::Device(key) => self.registry.check_device_sequence(key, seq),
        };
        let expected = match checked {
            Ok(SequenceCheck::Accepted) => return Ok(()),
            Ok(SequenceCheck::OutOfOrder { expected }) => expected,
            Ok(SequenceCheck::Offline) => {
                tracing::warn!(entity = %entity, seq, "data from a node without a live birth");
                if self.config.sequence.policy == SequencePolicy::RejectAndRebirth {
                    self.request_rebirth(&node).await;
                }
                return Err(SparkplugError::EntityOffline(entity.clone()));
            }
            Err(err @ SparkplugError::UnknownEntity(_)) => {
                tracing::warn!(entity = %entity, seq, "data from a node never born");
                if self.config.sequence.policy == SequencePolicy::RejectAndRebirth {
                    self.request_rebirth(&node).await;
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        self.metrics.sequence_violations.inc();
        tracing::warn!(
            entity = %entity,
            expected,
            received = seq,
            policy = ?self.config.sequence.policy,
            "sequence violation"
        );
        match self.config.sequence.policy {
            SequencePolicy::LogOnly => {
                self.registry.resync_sequence(&node, seq)?;
                if let EntityKey::Device(key) = entity {
                    if self.registry.device(key).is_some() {
                        self.registry.record_device_sequence(key, seq)?;
                    }
                }
                Ok(())
            }
            SequencePolicy::Reject => Err(violation(entity, expected, seq)),
            SequencePolicy::RejectAndRebirth => {
                self.request_rebirth(&node).await;
                Err(violation(entity, expected, seq))
            }
        }
    }

    /// Ask the edge node for a fresh birth, at most once per cooldown window.
    /// Returns whether a request was issued.
    pub async fn request_rebirth(&self, node: &NodeKey) -> bool {
        let now = self.clock.now();
        let cooldown = self.config.sequence.rebirth_cooldown();
        {
            let mut requested = self.rebirths_requested.lock();
            // Expired windows are dropped so ids that never birth do not accumulate.
            requested.retain(|_, at| now.saturating_duration_since(*at) < cooldown);
            if requested.contains_key(node) {
                tracing::debug!(node = %node, "rebirth already requested");
                return false;
            }
            requested.insert(node.clone(), now);
        }
        let request = match self
            .rebirth
            .rebirth_request(&self.topics, self.codec.as_ref(), node)
        {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(node = %node, "rebirth request not built: {err}");
                return false;
            }
        };
        self.metrics.rebirth_requests.inc();
        tracing::info!(node = %node, topic = %request.topic, "rebirth requested");
        self.publish_or_queue(request).await;
        true
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Publish through the transport; a refused publish is buffered for the
    /// next upstream restore. Returns true if it went out immediately.
    pub async fn publish_or_queue(&self, publish: OutboundPublish) -> bool {
        let fallback = publish.clone();
        match self.transport.publish(publish).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(topic = %fallback.topic, "publish failed, queueing: {err}");
                let evicted = self
                    .queue
                    .enqueue(QueuedMessage::from_publish(fallback, self.clock.unix_millis()));
                self.metrics.queue_evictions.add(evicted as u64);
                self.metrics.queued_messages.set(self.queue.size() as u64);
                false
            }
        }
    }

    /// Flush everything buffered while the upstream link was down.
    pub async fn on_upstream_restored(&self) -> DrainReport {
        let report = self.queue.drain_to_transport(self.transport.as_ref()).await;
        self.metrics.queue_forward_failures.add(report.failed as u64);
        self.metrics.queued_messages.set(self.queue.size() as u64);
        report
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Consume transport events in order until the sender side closes.
    pub fn spawn_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> Option<JoinHandle<()>> {
        if Handle::try_current().is_err() {
            tracing::info!("skipping sparkplug event loop; no tokio runtime detected");
            return None;
        }
        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(err) = self.handle_event(event).await {
                    log_event_error(&err);
                }
            }
            tracing::info!("sparkplug event loop stopped");
        }))
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn checkpoint_node(&self, key: &NodeKey) {
        if let (Some(persistence), Some(node)) = (&self.persistence, self.registry.node(key)) {
            self.checkpoint("node", persistence.save_node(&node).await);
        }
    }

    fn checkpoint(&self, what: &'static str, result: std::result::Result<(), StoreError>) {
        if let Err(err) = result {
            self.metrics.persistence_failures.inc();
            tracing::warn!(record = what, "checkpoint failed, continuing in memory: {err}");
        }
    }

    fn refresh_online_gauge(&self) {
        self.metrics
            .online_nodes
            .set(self.registry.online_nodes().len() as u64);
    }
}

fn node_key(info: &TopicInfo) -> NodeKey {
    NodeKey::new(info.group_id.clone(), info.edge_node_id.clone())
}

fn device_key(info: &TopicInfo) -> DeviceKey {
    DeviceKey::new(
        info.group_id.clone(),
        info.edge_node_id.clone(),
        info.device_id.clone().unwrap_or_default(),
    )
}

fn require_bd_seq(kind: MessageType, publish: &PublishEvent, payload: &SparkplugPayload) -> Result<u8> {
    payload.bd_seq().ok_or_else(|| SparkplugError::MissingField {
        kind,
        topic: publish.topic.clone(),
        field: "bdSeq",
    })
}

fn require_seq(kind: MessageType, publish: &PublishEvent, payload: &SparkplugPayload) -> Result<u8> {
    payload.seq_u8().ok_or_else(|| SparkplugError::MissingField {
        kind,
        topic: publish.topic.clone(),
        field: "seq",
    })
}

fn violation(entity: &EntityKey, expected: u8, received: u8) -> SparkplugError {
    SparkplugError::SequenceViolation {
        entity: entity.clone(),
        expected,
        received,
    }
}

fn log_event_error(err: &SparkplugError) {
    match err {
        // Already logged at error level where it was detected.
        SparkplugError::BirthCorrelationFailure { .. } => {}
        SparkplugError::SequenceViolation { .. } | SparkplugError::EntityOffline(_) => {
            tracing::debug!("publish dropped: {err}");
        }
        _ => tracing::warn!("sparkplug event rejected: {err}"),
    }
}
