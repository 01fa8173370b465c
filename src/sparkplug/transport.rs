//! Narrow interface to the MQTT transport collaborator.
//!
//! The broker owns sockets, routing and TLS. This core only consumes its
//! lifecycle/publish events and hands it publish requests.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Publish request handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

impl OutboundPublish {
    /// Protocol-generated traffic goes out at QoS 0 without retain.
    pub fn fire_and_forget(topic: String, payload: impl Into<Bytes>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            qos: Qos::AtMostOnce,
            retain: false,
        }
    }
}

/// Decoded publish observed by the broker.
#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub client_id: String,
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

/// CONNECT observed by the broker.
#[derive(Debug, Clone)]
pub struct ConnectEvent {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    /// MQTT 5 session expiry interval; `None` for 3.1.1 clients.
    pub session_expiry_secs: Option<u32>,
    pub will_topic: Option<String>,
    pub will_payload: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub client_id: String,
}

/// Events the processing loop consumes, in transport order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connect(ConnectEvent),
    Publish(PublishEvent),
    Disconnect(DisconnectEvent),
    /// The upstream link came back; buffered traffic may be flushed.
    UpstreamRestored,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },
}

pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// Outbound side of the transport collaborator.
pub trait Transport: Send + Sync {
    fn publish(&self, message: OutboundPublish) -> PublishFuture<'_>;
}

/// Transport that hands publishes to an in-process channel consumed by the broker.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundPublish>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<OutboundPublish>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundPublish>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn publish(&self, message: OutboundPublish) -> PublishFuture<'_> {
        Box::pin(async move {
            self.tx
                .send(message)
                .await
                .map_err(|err| TransportError::Unavailable(format!("broker channel closed: {err}")))
        })
    }
}
