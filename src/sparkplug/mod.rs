//! Collaborator interfaces: transport, topic namespace and payload codec.

pub mod payload;
pub mod topic;
pub mod transport;

pub use payload::{
    CodecError, JsonPayloadCodec, Metric, MetricQuality, MetricValue, PayloadCodec,
    SparkplugPayload, BD_SEQ_METRIC, REBIRTH_METRIC,
};
pub use topic::{MessageType, SparkplugTopicParser, TopicInfo, TopicParser};
pub use transport::{
    ChannelTransport, ConnectEvent, DisconnectEvent, OutboundPublish, PublishEvent,
    PublishFuture, Qos, Transport, TransportError, TransportEvent,
};
