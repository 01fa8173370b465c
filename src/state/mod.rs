//! Protocol state: entity registry, rebirth coordination, session lifecycle,
//! stale-session monitoring and the store-and-forward queue.

pub mod monitor;
pub mod queue;
pub mod rebirth;
pub mod registry;
pub mod session;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use monitor::{StaleSessionMonitor, SweepReport};
pub use queue::{DisconnectQueue, DrainReport, QueuedMessage};
pub use rebirth::RebirthCoordinator;
pub use registry::{DeviceState, EntityRegistry, MetricSnapshot, NodeState};
pub use session::{SessionManager, SessionOpen, SessionState};

/// Wrap an 8-bit sequence counter.
pub fn next_seq(current: u8) -> u8 {
    current.wrapping_add(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub group_id: String,
    pub edge_node_id: String,
}

impl NodeKey {
    pub fn new(group_id: impl Into<String>, edge_node_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            edge_node_id: edge_node_id.into(),
        }
    }

    pub fn device(&self, device_id: impl Into<String>) -> DeviceKey {
        DeviceKey {
            group_id: self.group_id.clone(),
            edge_node_id: self.edge_node_id.clone(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.edge_node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub group_id: String,
    pub edge_node_id: String,
    pub device_id: String,
}

impl DeviceKey {
    pub fn new(
        group_id: impl Into<String>,
        edge_node_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            edge_node_id: edge_node_id.into(),
            device_id: device_id.into(),
        }
    }

    pub fn node(&self) -> NodeKey {
        NodeKey::new(self.group_id.clone(), self.edge_node_id.clone())
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.group_id, self.edge_node_id, self.device_id
        )
    }
}

/// Either kind of tracked entity, used in error reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Node(NodeKey),
    Device(DeviceKey),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Node(key) => write!(f, "node {key}"),
            EntityKey::Device(key) => write!(f, "device {key}"),
        }
    }
}

impl From<NodeKey> for EntityKey {
    fn from(key: NodeKey) -> Self {
        EntityKey::Node(key)
    }
}

impl From<DeviceKey> for EntityKey {
    fn from(key: DeviceKey) -> Self {
        EntityKey::Device(key)
    }
}
