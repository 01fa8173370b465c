//! Checkpoint adapter between the in-memory state and a [`StateStore`].
//!
//! Node and device records are stored as JSON with their counters and
//! timestamps rendered as decimal strings, so consumers that parse numbers
//! as doubles never lose precision. Births are kept as the raw payload bytes.

use super::{
    birth_key, device_key, device_prefix, node_key, node_prefix, session_key, session_prefix,
    FsStateStore, MemoryStateStore, StateStore, StoreError,
};
use crate::config::StoreConfig;
use crate::sparkplug::MessageType;
use crate::state::registry::{DeviceState, EntityRegistry, MetricSnapshot, NodeState};
use crate::state::session::{SessionManager, SessionState};
use crate::state::{DeviceKey, NodeKey};
use crate::time::Clock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNode {
    pub group_id: String,
    pub edge_node_id: String,
    pub bd_seq: String,
    pub seq: String,
    pub online: bool,
    pub last_seen: String,
    #[serde(default)]
    pub birth_timestamp: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSnapshot>,
    #[serde(default)]
    pub aliases: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDevice {
    pub group_id: String,
    pub edge_node_id: String,
    pub device_id: String,
    pub seq: String,
    pub online: bool,
    pub last_seen: String,
    #[serde(default)]
    pub birth_timestamp: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSnapshot>,
    #[serde(default)]
    pub aliases: BTreeMap<u64, String>,
}

impl From<&NodeState> for PersistedNode {
    fn from(node: &NodeState) -> Self {
        Self {
            group_id: node.group_id.clone(),
            edge_node_id: node.edge_node_id.clone(),
            bd_seq: node.bd_seq.to_string(),
            seq: node.seq.to_string(),
            online: node.online,
            last_seen: node.last_seen.to_string(),
            birth_timestamp: node.birth_timestamp.map(|ts| ts.to_string()),
            metrics: node.metrics.clone(),
            aliases: node.aliases.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }
}

impl PersistedNode {
    pub fn into_state(self, key: &str) -> Result<NodeState, StoreError> {
        Ok(NodeState {
            bd_seq: parse_field(key, "bdSeq", &self.bd_seq)?,
            seq: parse_field(key, "seq", &self.seq)?,
            last_seen: parse_field(key, "lastSeen", &self.last_seen)?,
            birth_timestamp: self
                .birth_timestamp
                .as_deref()
                .map(|ts| parse_field(key, "birthTimestamp", ts))
                .transpose()?,
            group_id: self.group_id,
            edge_node_id: self.edge_node_id,
            online: self.online,
            metrics: self.metrics,
            aliases: self.aliases.into_iter().collect::<HashMap<_, _>>(),
        })
    }
}

impl From<&DeviceState> for PersistedDevice {
    fn from(device: &DeviceState) -> Self {
        Self {
            group_id: device.group_id.clone(),
            edge_node_id: device.edge_node_id.clone(),
            device_id: device.device_id.clone(),
            seq: device.seq.to_string(),
            online: device.online,
            last_seen: device.last_seen.to_string(),
            birth_timestamp: device.birth_timestamp.map(|ts| ts.to_string()),
            metrics: device.metrics.clone(),
            aliases: device.aliases.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }
}

impl PersistedDevice {
    pub fn into_state(self, key: &str) -> Result<DeviceState, StoreError> {
        Ok(DeviceState {
            seq: parse_field(key, "seq", &self.seq)?,
            last_seen: parse_field(key, "lastSeen", &self.last_seen)?,
            birth_timestamp: self
                .birth_timestamp
                .as_deref()
                .map(|ts| parse_field(key, "birthTimestamp", ts))
                .transpose()?,
            group_id: self.group_id,
            edge_node_id: self.edge_node_id,
            device_id: self.device_id,
            online: self.online,
            metrics: self.metrics,
            aliases: self.aliases.into_iter().collect::<HashMap<_, _>>(),
        })
    }
}

/// Session checkpoint; the bound node is flattened to its two ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub client_id: String,
    pub connected: bool,
    #[serde(default)]
    pub connect_time: Option<String>,
    #[serde(default)]
    pub disconnect_time: Option<String>,
    pub clean_session: bool,
    #[serde(default)]
    pub bd_seq: Option<String>,
    pub keep_alive: String,
    #[serde(default)]
    pub will_topic: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub edge_node_id: Option<String>,
    #[serde(default)]
    pub ndeath_published: bool,
    #[serde(default)]
    pub stale: bool,
}

impl From<&SessionState> for PersistedSession {
    fn from(session: &SessionState) -> Self {
        Self {
            client_id: session.client_id.clone(),
            connected: session.connected,
            connect_time: session.connect_time.map(|ts| ts.to_string()),
            disconnect_time: session.disconnect_time.map(|ts| ts.to_string()),
            clean_session: session.clean_session,
            bd_seq: session.bd_seq.map(|bd| bd.to_string()),
            keep_alive: session.keep_alive_secs.to_string(),
            will_topic: session.will_topic.clone(),
            group_id: session.node.as_ref().map(|n| n.group_id.clone()),
            edge_node_id: session.node.as_ref().map(|n| n.edge_node_id.clone()),
            ndeath_published: session.ndeath_published,
            stale: session.stale,
        }
    }
}

impl PersistedSession {
    pub fn into_state(self, key: &str) -> Result<SessionState, StoreError> {
        let node = match (self.group_id, self.edge_node_id) {
            (Some(group_id), Some(edge_node_id)) => Some(NodeKey::new(group_id, edge_node_id)),
            (None, None) => None,
            _ => {
                return Err(StoreError::Corrupt {
                    key: key.to_string(),
                    reason: "node binding needs both groupId and edgeNodeId".to_string(),
                })
            }
        };
        Ok(SessionState {
            connect_time: optional_field(key, "connectTime", self.connect_time.as_deref())?,
            disconnect_time: optional_field(key, "disconnectTime", self.disconnect_time.as_deref())?,
            bd_seq: optional_field(key, "bdSeq", self.bd_seq.as_deref())?,
            keep_alive_secs: parse_field(key, "keepAlive", &self.keep_alive)?,
            client_id: self.client_id,
            connected: self.connected,
            clean_session: self.clean_session,
            will_topic: self.will_topic,
            node,
            ndeath_published: self.ndeath_published,
            stale: self.stale,
        })
    }
}

fn optional_field<T: FromStr>(key: &str, field: &str, raw: Option<&str>) -> Result<Option<T>, StoreError> {
    raw.map(|raw| parse_field(key, field, raw)).transpose()
}

fn parse_field<T: FromStr>(key: &str, field: &str, raw: &str) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("{field} is not a valid counter: {raw:?}"),
    })
}

/// What a restore brought back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub nodes: usize,
    pub devices: usize,
    pub sessions: usize,
    /// Records that were unreadable or already present in memory.
    pub skipped: usize,
}

pub struct StatePersistence {
    store: Arc<dyn StateStore>,
    config: StoreConfig,
}

impl StatePersistence {
    pub fn new(store: Arc<dyn StateStore>, config: StoreConfig) -> Self {
        Self { store, config }
    }

    /// Build the store `config` describes: none when checkpointing is
    /// disabled, files under `dir` when one is set, memory otherwise.
    pub async fn from_config(config: &StoreConfig) -> Result<Option<Self>, StoreError> {
        if !config.enabled {
            return Ok(None);
        }
        let store: Arc<dyn StateStore> = match &config.dir {
            Some(dir) => {
                tracing::info!(dir = %dir.display(), "checkpointing to filesystem store");
                Arc::new(FsStateStore::open(dir.clone()).await?)
            }
            None => Arc::new(MemoryStateStore::new()),
        };
        Ok(Some(Self::new(store, config.clone())))
    }

    pub async fn save_node(&self, node: &NodeState) -> Result<(), StoreError> {
        let key = node_key(&node.group_id, &node.edge_node_id);
        let bytes = serde_json::to_vec(&PersistedNode::from(node))?;
        self.store.put(&key, bytes, Some(self.config.node_ttl())).await
    }

    pub async fn load_node(&self, node: &NodeKey) -> Result<Option<NodeState>, StoreError> {
        let key = node_key(&node.group_id, &node.edge_node_id);
        match self.load_json::<PersistedNode>(&key).await? {
            Some(persisted) => Ok(Some(persisted.into_state(&key)?)),
            None => Ok(None),
        }
    }

    pub async fn save_device(&self, device: &DeviceState) -> Result<(), StoreError> {
        let key = device_key(&device.group_id, &device.edge_node_id, &device.device_id);
        let bytes = serde_json::to_vec(&PersistedDevice::from(device))?;
        self.store.put(&key, bytes, Some(self.config.device_ttl())).await
    }

    pub async fn load_device(&self, device: &DeviceKey) -> Result<Option<DeviceState>, StoreError> {
        let key = device_key(&device.group_id, &device.edge_node_id, &device.device_id);
        match self.load_json::<PersistedDevice>(&key).await? {
            Some(persisted) => Ok(Some(persisted.into_state(&key)?)),
            None => Ok(None),
        }
    }

    pub async fn save_session(&self, session: &SessionState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&PersistedSession::from(session))?;
        self.store
            .put(&session_key(&session.client_id), bytes, Some(self.config.session_ttl()))
            .await
    }

    pub async fn load_session(&self, client_id: &str) -> Result<Option<SessionState>, StoreError> {
        let key = session_key(client_id);
        self.load_json::<PersistedSession>(&key)
            .await?
            .map(|session| session.into_state(&key))
            .transpose()
    }

    pub async fn remove_session(&self, client_id: &str) -> Result<(), StoreError> {
        self.store.delete(&session_key(client_id)).await
    }

    /// Keep the raw payload of the latest NBIRTH (no device) or DBIRTH.
    pub async fn save_birth(
        &self,
        kind: MessageType,
        node: &NodeKey,
        device_id: Option<&str>,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let key = birth_key(kind.as_str(), &node.group_id, &node.edge_node_id, device_id);
        self.store
            .put(&key, payload.to_vec(), Some(self.config.birth_ttl()))
            .await
    }

    pub async fn load_birth(
        &self,
        kind: MessageType,
        node: &NodeKey,
        device_id: Option<&str>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let key = birth_key(kind.as_str(), &node.group_id, &node.edge_node_id, device_id);
        self.store.get(&key).await
    }

    /// Seed the registry and session table from the last checkpoint.
    ///
    /// Live records win over stored ones. Restored sessions come back
    /// disconnected; their transport connections did not survive the restart.
    pub async fn restore<C: Clock>(
        &self,
        registry: &EntityRegistry<C>,
        sessions: &SessionManager<C>,
    ) -> Result<RestoreReport, StoreError> {
        let mut report = RestoreReport::default();

        for key in self.store.scan_prefix(node_prefix()).await? {
            let restored = self
                .load_json::<PersistedNode>(&key)
                .await
                .and_then(|node| node.map(|node| node.into_state(&key)).transpose());
            match restored {
                Ok(Some(node)) => {
                    if registry.hydrate_node(node) {
                        report.nodes += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(key = %key, "skipping unreadable node checkpoint: {err}");
                    report.skipped += 1;
                }
            }
        }

        for key in self.store.scan_prefix(device_prefix()).await? {
            let restored = self
                .load_json::<PersistedDevice>(&key)
                .await
                .and_then(|device| device.map(|device| device.into_state(&key)).transpose());
            match restored {
                Ok(Some(device)) => {
                    if registry.hydrate_device(device) {
                        report.devices += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(key = %key, "skipping unreadable device checkpoint: {err}");
                    report.skipped += 1;
                }
            }
        }

        for key in self.store.scan_prefix(session_prefix()).await? {
            let restored = self
                .load_json::<PersistedSession>(&key)
                .await
                .and_then(|session| session.map(|session| session.into_state(&key)).transpose());
            match restored {
                Ok(Some(mut session)) => {
                    session.connected = false;
                    session.stale = false;
                    if sessions.hydrate(session) {
                        report.sessions += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(key = %key, "skipping unreadable session checkpoint: {err}");
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            nodes = report.nodes,
            devices = report.devices,
            sessions = report.sessions,
            skipped = report.skipped,
            "state restored from checkpoint"
        );
        Ok(report)
    }

    async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: err.to_string(),
                }),
            None => Ok(None),
        }
    }
}
