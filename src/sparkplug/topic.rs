//! Sparkplug topic namespace.
//!
//! `{namespace}/{group_id}/{message_type}/{edge_node_id}[/{device_id}]`, plus the
//! host application `STATE` topic which carries no node identity.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MessageType {
    NBirth,
    NDeath,
    NData,
    NCmd,
    DBirth,
    DDeath,
    DData,
    DCmd,
    State,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::NBirth => "NBIRTH",
            MessageType::NDeath => "NDEATH",
            MessageType::NData => "NDATA",
            MessageType::NCmd => "NCMD",
            MessageType::DBirth => "DBIRTH",
            MessageType::DDeath => "DDEATH",
            MessageType::DData => "DDATA",
            MessageType::DCmd => "DCMD",
            MessageType::State => "STATE",
        }
    }

    /// Device-scoped messages must carry a device id segment.
    pub fn is_device_scoped(self) -> bool {
        matches!(
            self,
            MessageType::DBirth | MessageType::DDeath | MessageType::DData | MessageType::DCmd
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NBIRTH" => Ok(MessageType::NBirth),
            "NDEATH" => Ok(MessageType::NDeath),
            "NDATA" => Ok(MessageType::NData),
            "NCMD" => Ok(MessageType::NCmd),
            "DBIRTH" => Ok(MessageType::DBirth),
            "DDEATH" => Ok(MessageType::DDeath),
            "DDATA" => Ok(MessageType::DData),
            "DCMD" => Ok(MessageType::DCmd),
            "STATE" => Ok(MessageType::State),
            other => Err(format!("unknown sparkplug message type {other}")),
        }
    }
}

/// Result of parsing a topic string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub namespace: String,
    pub group_id: String,
    pub message_type: Option<MessageType>,
    pub edge_node_id: String,
    pub device_id: Option<String>,
    pub is_valid: bool,
}

impl TopicInfo {
    fn invalid(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            group_id: String::new(),
            message_type: None,
            edge_node_id: String::new(),
            device_id: None,
            is_valid: false,
        }
    }
}

/// Topic-namespace collaborator.
pub trait TopicParser: Send + Sync {
    fn parse(&self, topic: &str) -> TopicInfo;
}

/// Parser and builder for the `spBv1.0` namespace (or a configured alternative).
#[derive(Debug, Clone)]
pub struct SparkplugTopicParser {
    namespace: String,
}

impl SparkplugTopicParser {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn node_topic(&self, group_id: &str, message_type: MessageType, edge_node_id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.namespace, group_id, message_type, edge_node_id
        )
    }

    pub fn device_topic(
        &self,
        group_id: &str,
        message_type: MessageType,
        edge_node_id: &str,
        device_id: &str,
    ) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.namespace, group_id, message_type, edge_node_id, device_id
        )
    }
}

impl Default for SparkplugTopicParser {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_NAMESPACE)
    }
}

impl TopicParser for SparkplugTopicParser {
    fn parse(&self, topic: &str) -> TopicInfo {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.first().copied() != Some(self.namespace.as_str()) {
            return TopicInfo::invalid(parts.first().copied().unwrap_or_default());
        }
        // spBv1.0/STATE/{host_id}
        if parts.len() == 3 && parts[1] == "STATE" {
            return TopicInfo {
                namespace: self.namespace.clone(),
                group_id: String::new(),
                message_type: Some(MessageType::State),
                edge_node_id: parts[2].to_string(),
                device_id: None,
                is_valid: !parts[2].is_empty(),
            };
        }
        if parts.len() != 4 && parts.len() != 5 {
            return TopicInfo::invalid(&self.namespace);
        }
        let message_type = parts[2].parse::<MessageType>().ok();
        let device_id = parts.get(4).map(|s| s.to_string());
        let shape_ok = match message_type {
            Some(MessageType::State) | None => false,
            Some(kind) => kind.is_device_scoped() == device_id.is_some(),
        };
        let ids_ok = !parts[1].is_empty()
            && !parts[3].is_empty()
            && device_id.as_deref().map(|d| !d.is_empty()).unwrap_or(true);
        TopicInfo {
            namespace: self.namespace.clone(),
            group_id: parts[1].to_string(),
            message_type,
            edge_node_id: parts[3].to_string(),
            device_id,
            is_valid: shape_ok && ids_ok,
        }
    }
}
