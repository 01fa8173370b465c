//! Decoded Sparkplug payload model and the codec collaborator interface.
//!
//! The binary protobuf codec lives outside this crate; the state core only
//! needs the timestamp, the `seq` and the metric list.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metric carrying the birth/death sequence in NBIRTH/NDEATH payloads.
pub const BD_SEQ_METRIC: &str = "bdSeq";
/// Boolean metric written to NCMD to ask an edge node to rebirth.
pub const REBIRTH_METRIC: &str = "Node Control/Rebirth";

/// Sparkplug quality codes carried as a metric property.
pub const QUALITY_GOOD: u32 = 192;
pub const QUALITY_STALE: u32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Null,
}

impl MetricValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            MetricValue::UInt(v) => Some(*v),
            MetricValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricQuality {
    Good,
    Bad,
    Stale,
}

impl MetricQuality {
    pub fn from_code(code: u32) -> Self {
        match code {
            QUALITY_GOOD => MetricQuality::Good,
            QUALITY_STALE => MetricQuality::Stale,
            _ => MetricQuality::Bad,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub alias: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    /// Raw quality property; absent means good.
    #[serde(default)]
    pub quality: Option<u32>,
    pub value: MetricValue,
}

impl Metric {
    pub fn named(name: impl Into<String>, value: MetricValue) -> Self {
        Self {
            name: Some(name.into()),
            alias: None,
            timestamp: None,
            quality: None,
            value,
        }
    }

    pub fn aliased(alias: u64, value: MetricValue) -> Self {
        Self {
            name: None,
            alias: Some(alias),
            timestamp: None,
            quality: None,
            value,
        }
    }

    pub fn with_alias(mut self, alias: u64) -> Self {
        self.alias = Some(alias);
        self
    }

    pub fn with_quality(mut self, quality: u32) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn effective_quality(&self) -> MetricQuality {
        self.quality
            .map(MetricQuality::from_code)
            .unwrap_or(MetricQuality::Good)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparkplugPayload {
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

impl SparkplugPayload {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp: Some(timestamp),
            seq: None,
            metrics: Vec::new(),
        }
    }

    pub fn with_seq(mut self, seq: u8) -> Self {
        self.seq = Some(u64::from(seq));
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }

    /// The `bdSeq` metric value, truncated to its 8-bit wire range.
    pub fn bd_seq(&self) -> Option<u8> {
        self.metrics
            .iter()
            .find(|m| m.name.as_deref() == Some(BD_SEQ_METRIC))
            .and_then(|m| m.value.as_u64())
            .map(|v| (v % 256) as u8)
    }

    /// The payload `seq`, truncated to its 8-bit wire range.
    pub fn seq_u8(&self) -> Option<u8> {
        self.seq.map(|v| (v % 256) as u8)
    }

    /// Death payload announcing the end of the birth identified by `bd_seq`.
    pub fn death(timestamp: u64, bd_seq: u8) -> Self {
        Self::new(timestamp).with_metric(Metric::named(
            BD_SEQ_METRIC,
            MetricValue::UInt(u64::from(bd_seq)),
        ))
    }

    /// NCMD payload asking an edge node to publish a fresh birth.
    pub fn rebirth_command(timestamp: u64) -> Self {
        Self::new(timestamp).with_metric(Metric::named(REBIRTH_METRIC, MetricValue::Bool(true)))
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload decode failed: {0}")]
    Decode(String),
    #[error("payload encode failed: {0}")]
    Encode(String),
}

/// Payload-codec collaborator.
pub trait PayloadCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<SparkplugPayload, CodecError>;
    fn encode(&self, payload: &SparkplugPayload) -> Result<Vec<u8>, CodecError>;
}

/// JSON rendition of the payload model, used by tooling and in-process brokers
/// that do not carry the protobuf codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadCodec;

impl PayloadCodec for JsonPayloadCodec {
    fn decode(&self, bytes: &[u8]) -> Result<SparkplugPayload, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
    }

    fn encode(&self, payload: &SparkplugPayload) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload).map_err(|err| CodecError::Encode(err.to_string()))
    }
}
