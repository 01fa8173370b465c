#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Import style
#![allow(clippy::wildcard_imports)]
// Struct field patterns
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::struct_field_names)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
// Self usage
#![allow(clippy::unused_self)]
// Option/Result patterns
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Type defaults
#![allow(clippy::default_trait_access)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::new_without_default)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Unit patterns
#![allow(clippy::ignored_unit_patterns)]

//! Sparkplug B protocol state core.
//!
//! Tracks every edge node and device on a Sparkplug namespace, validates the
//! `seq`/`bdSeq` sequencing of their births, data and deaths, correlates
//! rebirths with last-will payloads, synthesizes deaths for sessions that go
//! silent, and buffers outbound traffic while the upstream link is down.
//!
//! The MQTT transport, payload codec and durable store are collaborators
//! consumed through the traits in [`sparkplug`] and [`store`].
//!
//! Module organization:
//! - `core` - Configuration and clock abstraction
//! - `sparkplug` - Transport, topic and payload collaborator interfaces
//! - `state` - Registry, rebirth, sessions, stale monitor, disconnect queue
//! - `store` - Durable checkpoint store and persistence adapter
//! - `processor` - Transport event handling
//! - `ops` - Telemetry and metrics

pub mod core;
pub mod error;
pub mod ops;
pub mod processor;
pub mod sparkplug;
pub mod state;
pub mod store;

pub use self::core::{config, time};

pub use error::{Result, SparkplugError};
pub use processor::{MessageProcessor, PublishOutcome};
pub use state::{
    DeviceKey, DisconnectQueue, EntityKey, EntityRegistry, NodeKey, RebirthCoordinator,
    SessionManager, StaleSessionMonitor,
};
