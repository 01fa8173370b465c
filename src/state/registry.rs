//! Entity state registry.
//!
//! Authoritative in-memory record of every edge node and device seen on the
//! namespace. Each entity sits behind its own mutex so inbound processing and
//! the stale-session sweep serialize per key without a global write lock.
//! Records are never removed; a death only flips them offline so sequence
//! history survives reconnects.

use super::{next_seq, DeviceKey, EntityKey, NodeKey};
use crate::error::{Result, SparkplugError};
use crate::sparkplug::{Metric, MetricQuality, MetricValue};
use crate::time::Clock;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Last known value of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub value: MetricValue,
    pub quality: MetricQuality,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub group_id: String,
    pub edge_node_id: String,
    pub bd_seq: u8,
    /// Only meaningful while `online`.
    pub seq: u8,
    pub online: bool,
    pub last_seen: u64,
    pub birth_timestamp: Option<u64>,
    pub metrics: BTreeMap<String, MetricSnapshot>,
    /// Alias → metric name, learned from the current birth.
    pub aliases: HashMap<u64, String>,
}

impl NodeState {
    fn new(key: &NodeKey, bd_seq: u8, online: bool, now: u64) -> Self {
        Self {
            group_id: key.group_id.clone(),
            edge_node_id: key.edge_node_id.clone(),
            bd_seq,
            seq: 0,
            online,
            last_seen: now,
            birth_timestamp: None,
            metrics: BTreeMap::new(),
            aliases: HashMap::new(),
        }
    }

    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.group_id.clone(), self.edge_node_id.clone())
    }

    fn birth(&mut self, bd_seq: u8, now: u64) {
        self.bd_seq = bd_seq;
        self.seq = 0;
        self.online = true;
        self.birth_timestamp = Some(now);
        self.last_seen = now;
        self.metrics.clear();
        self.aliases.clear();
    }
}

/// Devices share the parent node's `bdSeq`; `seq` mirrors the last node
/// sequence value accepted on a message for this device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub group_id: String,
    pub edge_node_id: String,
    pub device_id: String,
    pub seq: u8,
    pub online: bool,
    pub last_seen: u64,
    pub birth_timestamp: Option<u64>,
    pub metrics: BTreeMap<String, MetricSnapshot>,
    pub aliases: HashMap<u64, String>,
}

impl DeviceState {
    fn new(key: &DeviceKey, now: u64) -> Self {
        Self {
            group_id: key.group_id.clone(),
            edge_node_id: key.edge_node_id.clone(),
            device_id: key.device_id.clone(),
            seq: 0,
            online: false,
            last_seen: now,
            birth_timestamp: None,
            metrics: BTreeMap::new(),
            aliases: HashMap::new(),
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(
            self.group_id.clone(),
            self.edge_node_id.clone(),
            self.device_id.clone(),
        )
    }

    pub fn node_key(&self) -> NodeKey {
        NodeKey::new(self.group_id.clone(), self.edge_node_id.clone())
    }
}

/// Outcome of checking a data `seq` against the node's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    Accepted,
    OutOfOrder { expected: u8 },
    /// The node has no live birth; nothing it sends is in sequence.
    Offline,
}

type Shared<T> = Arc<Mutex<T>>;

pub struct EntityRegistry<C: Clock> {
    clock: C,
    nodes: RwLock<HashMap<NodeKey, Shared<NodeState>>>,
    devices: RwLock<HashMap<DeviceKey, Shared<DeviceState>>>,
}

impl<C: Clock> EntityRegistry<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            nodes: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
        }
    }

    fn node_entry(&self, key: &NodeKey) -> Option<Shared<NodeState>> {
        self.nodes.read().get(key).cloned()
    }

    fn device_entry(&self, key: &DeviceKey) -> Option<Shared<DeviceState>> {
        self.devices.read().get(key).cloned()
    }

    fn with_node<T>(&self, key: &NodeKey, f: impl FnOnce(&mut NodeState) -> T) -> Result<T> {
        let entry = self
            .node_entry(key)
            .ok_or_else(|| SparkplugError::UnknownEntity(EntityKey::Node(key.clone())))?;
        let mut guard = entry.lock();
        Ok(f(&mut guard))
    }

    fn with_device<T>(&self, key: &DeviceKey, f: impl FnOnce(&mut DeviceState) -> T) -> Result<T> {
        let entry = self
            .device_entry(key)
            .ok_or_else(|| SparkplugError::UnknownEntity(EntityKey::Device(key.clone())))?;
        let mut guard = entry.lock();
        Ok(f(&mut guard))
    }

    fn node_entry_or_insert(&self, key: &NodeKey, bd_seq: u8, online: bool) -> Shared<NodeState> {
        if let Some(entry) = self.node_entry(key) {
            return entry;
        }
        let now = self.clock.unix_millis();
        self.nodes
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(NodeState::new(key, bd_seq, online, now))))
            .clone()
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Create or refresh a node record without a birth: `seq` is preserved.
    pub fn upsert_node(&self, key: &NodeKey, bd_seq: u8, online: bool) -> NodeState {
        let now = self.clock.unix_millis();
        let entry = self.node_entry_or_insert(key, bd_seq, online);
        let mut node = entry.lock();
        node.bd_seq = bd_seq;
        node.online = online;
        node.last_seen = now;
        node.clone()
    }

    /// Apply a birth: new `bdSeq`, `seq` reset to 0, online, metric set replaced.
    pub fn apply_node_birth(&self, key: &NodeKey, bd_seq: u8, metrics: &[Metric]) -> NodeState {
        let now = self.clock.unix_millis();
        let entry = self.node_entry_or_insert(key, bd_seq, true);
        let mut node = entry.lock();
        node.birth(bd_seq, now);
        let node = &mut *node;
        apply_metrics(&mut node.metrics, &mut node.aliases, metrics, now, true);
        node.clone()
    }

    /// First contact always validates; afterwards the value must match the record.
    pub fn validate_birth_sequence(&self, key: &NodeKey, bd_seq: u8) -> bool {
        match self.node_entry(key) {
            Some(entry) => entry.lock().bd_seq == bd_seq,
            None => true,
        }
    }

    /// Accept `seq` iff it is the 8-bit successor of the node's counter.
    pub fn validate_data_sequence(&self, key: &NodeKey, seq: u8) -> Result<bool> {
        Ok(self.check_data_sequence(key, seq)? == SequenceCheck::Accepted)
    }

    /// Like [`validate_data_sequence`](Self::validate_data_sequence) but reports what was expected.
    /// A rejected value leaves the counter untouched.
    pub fn check_data_sequence(&self, key: &NodeKey, seq: u8) -> Result<SequenceCheck> {
        let now = self.clock.unix_millis();
        self.with_node(key, |node| {
            if !node.online {
                return SequenceCheck::Offline;
            }
            let expected = next_seq(node.seq);
            if seq != expected {
                return SequenceCheck::OutOfOrder { expected };
            }
            node.seq = seq;
            node.last_seen = now;
            SequenceCheck::Accepted
        })
    }

    /// Adopt `seq` as the node's counter regardless of the gap.
    pub fn resync_sequence(&self, key: &NodeKey, seq: u8) -> Result<()> {
        let now = self.clock.unix_millis();
        self.with_node(key, |node| {
            node.seq = seq;
            node.last_seen = now;
        })
    }

    pub fn mark_online(&self, key: &NodeKey) -> Result<()> {
        let now = self.clock.unix_millis();
        self.with_node(key, |node| {
            node.online = true;
            node.last_seen = now;
        })
    }

    /// Flip a node offline and mark every metric stale.
    pub fn mark_offline(&self, key: &NodeKey) -> Result<NodeState> {
        let now = self.clock.unix_millis();
        self.with_node(key, |node| {
            take_offline(&mut node.online, &mut node.metrics, &mut node.last_seen, now);
            node.clone()
        })
    }

    /// Mark offline only when the death refers to the birth currently on record.
    /// Returns false (and changes nothing) for a death of an earlier birth.
    pub fn mark_offline_for_birth(&self, key: &NodeKey, bd_seq: u8) -> Result<bool> {
        let now = self.clock.unix_millis();
        self.with_node(key, |node| {
            if node.bd_seq != bd_seq {
                return false;
            }
            take_offline(&mut node.online, &mut node.metrics, &mut node.last_seen, now);
            true
        })
    }

    /// Record metric values for a node, resolving aliases learned at birth.
    pub fn update_node_metrics(&self, key: &NodeKey, metrics: &[Metric]) -> Result<usize> {
        let now = self.clock.unix_millis();
        self.with_node(key, |node| {
            node.last_seen = now;
            apply_metrics(&mut node.metrics, &mut node.aliases, metrics, now, false)
        })
    }

    pub fn node(&self, key: &NodeKey) -> Option<NodeState> {
        self.node_entry(key).map(|entry| entry.lock().clone())
    }

    pub fn all_nodes(&self) -> Vec<NodeState> {
        let entries: Vec<_> = self.nodes.read().values().cloned().collect();
        let mut nodes: Vec<NodeState> = entries.iter().map(|e| e.lock().clone()).collect();
        nodes.sort_by(|a, b| {
            (a.group_id.as_str(), a.edge_node_id.as_str())
                .cmp(&(b.group_id.as_str(), b.edge_node_id.as_str()))
        });
        nodes
    }

    pub fn online_nodes(&self) -> Vec<NodeState> {
        self.all_nodes().into_iter().filter(|n| n.online).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    /// Apply a device birth. The parent node must have a birth on record.
    pub fn apply_device_birth(&self, key: &DeviceKey, seq: u8, metrics: &[Metric]) -> Result<DeviceState> {
        let node_key = key.node();
        if self.node_entry(&node_key).is_none() {
            return Err(SparkplugError::UnknownEntity(EntityKey::Node(node_key)));
        }
        let now = self.clock.unix_millis();
        let entry = match self.device_entry(key) {
            Some(entry) => entry,
            None => self
                .devices
                .write()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(DeviceState::new(key, now))))
                .clone(),
        };
        let mut device = entry.lock();
        device.online = true;
        device.seq = seq;
        device.birth_timestamp = Some(now);
        device.last_seen = now;
        device.metrics.clear();
        device.aliases.clear();
        let device = &mut *device;
        apply_metrics(&mut device.metrics, &mut device.aliases, metrics, now, true);
        Ok(device.clone())
    }

    /// Record the node sequence value accepted on a message for this device.
    pub fn record_device_sequence(&self, key: &DeviceKey, seq: u8) -> Result<()> {
        let now = self.clock.unix_millis();
        self.with_device(key, |device| {
            device.seq = seq;
            device.last_seen = now;
        })
    }

    /// Device messages ride the parent node's counter. An accepted value is
    /// mirrored onto the device record when one exists.
    pub fn check_device_sequence(&self, key: &DeviceKey, seq: u8) -> Result<SequenceCheck> {
        let check = self.check_data_sequence(&key.node(), seq)?;
        if check == SequenceCheck::Accepted && self.device_entry(key).is_some() {
            self.record_device_sequence(key, seq)?;
        }
        Ok(check)
    }

    pub fn validate_device_sequence(&self, key: &DeviceKey, seq: u8) -> Result<bool> {
        Ok(self.check_device_sequence(key, seq)? == SequenceCheck::Accepted)
    }

    pub fn update_device_metrics(&self, key: &DeviceKey, metrics: &[Metric]) -> Result<usize> {
        let now = self.clock.unix_millis();
        self.with_device(key, |device| {
            device.last_seen = now;
            apply_metrics(&mut device.metrics, &mut device.aliases, metrics, now, false)
        })
    }

    pub fn mark_device_offline(&self, key: &DeviceKey) -> Result<DeviceState> {
        let now = self.clock.unix_millis();
        self.with_device(key, |device| {
            take_offline(&mut device.online, &mut device.metrics, &mut device.last_seen, now);
            device.clone()
        })
    }

    /// A node death implies the death of all its devices. Returns how many flipped.
    pub fn mark_node_devices_offline(&self, node: &NodeKey) -> usize {
        let now = self.clock.unix_millis();
        let entries: Vec<_> = self
            .devices
            .read()
            .iter()
            .filter(|(key, _)| key.group_id == node.group_id && key.edge_node_id == node.edge_node_id)
            .map(|(_, entry)| entry.clone())
            .collect();
        let mut flipped = 0;
        for entry in entries {
            let mut device = entry.lock();
            if device.online {
                let device = &mut *device;
                take_offline(&mut device.online, &mut device.metrics, &mut device.last_seen, now);
                flipped += 1;
            }
        }
        flipped
    }

    pub fn device(&self, key: &DeviceKey) -> Option<DeviceState> {
        self.device_entry(key).map(|entry| entry.lock().clone())
    }

    pub fn devices_for_node(&self, node: &NodeKey) -> Vec<DeviceState> {
        let mut devices: Vec<DeviceState> = self
            .all_devices()
            .into_iter()
            .filter(|d| d.group_id == node.group_id && d.edge_node_id == node.edge_node_id)
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn online_devices(&self, node: &NodeKey) -> Vec<DeviceState> {
        self.devices_for_node(node)
            .into_iter()
            .filter(|d| d.online)
            .collect()
    }

    pub fn all_devices(&self) -> Vec<DeviceState> {
        let entries: Vec<_> = self.devices.read().values().cloned().collect();
        entries.iter().map(|e| e.lock().clone()).collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    // -----------------------------------------------------------------------
    // Checkpoint restore
    // -----------------------------------------------------------------------

    /// Seed a node from a checkpoint. Live records always win over restored ones.
    pub fn hydrate_node(&self, state: NodeState) -> bool {
        let key = state.key();
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&key) {
            return false;
        }
        nodes.insert(key, Arc::new(Mutex::new(state)));
        true
    }

    pub fn hydrate_device(&self, state: DeviceState) -> bool {
        let key = state.key();
        let mut devices = self.devices.write();
        if devices.contains_key(&key) {
            return false;
        }
        devices.insert(key, Arc::new(Mutex::new(state)));
        true
    }
}

fn take_offline(
    online: &mut bool,
    metrics: &mut BTreeMap<String, MetricSnapshot>,
    last_seen: &mut u64,
    now: u64,
) {
    *online = false;
    *last_seen = now;
    for snapshot in metrics.values_mut() {
        snapshot.quality = MetricQuality::Stale;
    }
}

/// Merge incoming metrics into the snapshot map. Births (`learn_aliases`) also
/// record alias → name bindings; later messages may carry only the alias.
fn apply_metrics(
    snapshots: &mut BTreeMap<String, MetricSnapshot>,
    aliases: &mut HashMap<u64, String>,
    incoming: &[Metric],
    now: u64,
    learn_aliases: bool,
) -> usize {
    let mut applied = 0;
    for metric in incoming {
        if learn_aliases {
            if let (Some(name), Some(alias)) = (&metric.name, metric.alias) {
                aliases.insert(alias, name.clone());
            }
        }
        let name = match (&metric.name, metric.alias) {
            (Some(name), _) => name.clone(),
            (None, Some(alias)) => match aliases.get(&alias) {
                Some(name) => name.clone(),
                None => {
                    tracing::debug!("dropping metric with unknown alias {alias}");
                    continue;
                }
            },
            (None, None) => continue,
        };
        snapshots.insert(
            name,
            MetricSnapshot {
                value: metric.value.clone(),
                quality: metric.effective_quality(),
                timestamp: metric.timestamp.unwrap_or(now),
            },
        );
        applied += 1;
    }
    applied
}
