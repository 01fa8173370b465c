//! Stale-session monitor.
//!
//! Periodically sweeps connected sessions for missed keep-alives. When a stale
//! session speaks for a node whose current birth has no death yet, the monitor
//! publishes the NDEATH the client failed to deliver and takes the node
//! offline. A failed publish leaves `ndeath_published` unset, so the next
//! sweep tries again.

use super::registry::{EntityRegistry, NodeState};
use super::session::{DeathCandidate, SessionManager};
use super::NodeKey;
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::ops::metrics::ProtocolMetrics;
use crate::sparkplug::{
    MessageType, OutboundPublish, PayloadCodec, SparkplugPayload, SparkplugTopicParser, Transport,
};
use crate::time::Clock;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// What a single sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions that crossed the stale threshold during this sweep.
    pub stale_sessions: Vec<String>,
    pub deaths_emitted: Vec<NodeKey>,
    /// Nodes whose synthetic death could not be transmitted; retried next sweep.
    pub deaths_failed: Vec<NodeKey>,
    /// Nodes that were already offline; flagged without publishing.
    pub already_offline: Vec<NodeKey>,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.stale_sessions.is_empty()
            && self.deaths_emitted.is_empty()
            && self.deaths_failed.is_empty()
            && self.already_offline.is_empty()
    }
}

pub struct StaleSessionMonitor<C: Clock> {
    clock: C,
    config: MonitorConfig,
    sessions: Arc<SessionManager<C>>,
    registry: Arc<EntityRegistry<C>>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PayloadCodec>,
    topics: SparkplugTopicParser,
    metrics: Arc<ProtocolMetrics>,
}

impl<C: Clock> StaleSessionMonitor<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: C,
        config: MonitorConfig,
        sessions: Arc<SessionManager<C>>,
        registry: Arc<EntityRegistry<C>>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn PayloadCodec>,
        topics: SparkplugTopicParser,
        metrics: Arc<ProtocolMetrics>,
    ) -> Self {
        Self {
            clock,
            config,
            sessions,
            registry,
            transport,
            codec,
            topics,
            metrics,
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let scan = self
            .sessions
            .scan_stale(|keep_alive| self.config.stale_threshold(keep_alive));
        let mut report = SweepReport::default();
        for client_id in scan.newly_stale {
            tracing::info!(client_id = %client_id, "session stale: keep-alive missed");
            self.metrics.stale_sessions.inc();
            report.stale_sessions.push(client_id);
        }
        for candidate in scan.pending_deaths {
            let node = match self.registry.node(&candidate.node) {
                Some(node) if node.online => node,
                _ => {
                    let still_dead: Result<bool> =
                        self.sessions.confirm_synthetic_death(&candidate, || {
                            Ok(self
                                .registry
                                .node(&candidate.node)
                                .map_or(true, |n| !n.online))
                        });
                    if matches!(still_dead, Ok(true)) {
                        report.already_offline.push(candidate.node);
                    }
                    continue;
                }
            };
            match self.emit_death(&node).await {
                Ok(()) => {
                    self.finish_death(&candidate, &node);
                    report.deaths_emitted.push(candidate.node);
                }
                Err(err) => {
                    self.metrics.synthetic_death_failures.inc();
                    tracing::warn!(
                        node = %candidate.node,
                        client_id = %candidate.client_id,
                        "synthetic NDEATH not delivered, retrying next sweep: {err}"
                    );
                    report.deaths_failed.push(candidate.node);
                }
            }
        }
        report
    }

    async fn emit_death(&self, node: &NodeState) -> Result<()> {
        let payload = SparkplugPayload::death(self.clock.unix_millis(), node.bd_seq);
        let bytes = self.codec.encode(&payload)?;
        let topic = self
            .topics
            .node_topic(&node.group_id, MessageType::NDeath, &node.edge_node_id);
        self.transport
            .publish(OutboundPublish::fire_and_forget(topic, bytes))
            .await?;
        Ok(())
    }

    fn finish_death(&self, candidate: &DeathCandidate, node: &NodeState) {
        // A rebirth that raced the publish keeps the node online and its flag clear.
        let applied = self.sessions.confirm_synthetic_death(candidate, || {
            self.registry.mark_offline_for_birth(&candidate.node, node.bd_seq)
        });
        match applied {
            Ok(true) => {
                let devices = self.registry.mark_node_devices_offline(&candidate.node);
                self.metrics.synthetic_deaths.inc();
                self.metrics
                    .online_nodes
                    .set(self.registry.online_nodes().len() as u64);
                tracing::info!(
                    node = %candidate.node,
                    client_id = %candidate.client_id,
                    bd_seq = node.bd_seq,
                    devices,
                    "synthetic NDEATH published"
                );
            }
            Ok(false) => {
                tracing::debug!(node = %candidate.node, "node reborn during synthetic death")
            }
            Err(err) => tracing::warn!(node = %candidate.node, "synthetic death bookkeeping: {err}"),
        }
    }

    /// Run [`sweep_once`](Self::sweep_once) every `sweep_interval` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("stale-session monitor disabled");
            return None;
        }
        if Handle::try_current().is_err() {
            tracing::info!("skipping stale-session monitor; no tokio runtime detected");
            return None;
        }
        let period = self.config.sweep_interval();
        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sweep_once().await;
                        if !report.is_quiet() {
                            tracing::debug!(?report, "stale-session sweep");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("stale-session monitor stopped");
        }))
    }
}
