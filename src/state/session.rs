//! Session lifecycle management.
//!
//! Sparkplug requires clean sessions with a zero session expiry. Both rules are
//! advisory here: violations are logged and counted, rejection is a transport
//! policy. A session may be bound to the edge node it births so the stale
//! monitor can speak for it when it disappears.

use super::NodeKey;
use crate::time::Clock;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub client_id: String,
    pub connected: bool,
    pub connect_time: Option<u64>,
    pub disconnect_time: Option<u64>,
    pub clean_session: bool,
    /// `bdSeq` carried by the last-will payload registered at connect.
    pub bd_seq: Option<u8>,
    pub keep_alive_secs: u16,
    pub will_topic: Option<String>,
    /// Edge node this session speaks for, once known.
    pub node: Option<NodeKey>,
    /// Death already published for the node's current birth.
    pub ndeath_published: bool,
    pub stale: bool,
}

/// Parameters of a CONNECT as seen by the lifecycle manager.
#[derive(Debug, Clone)]
pub struct SessionOpen {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub bd_seq: Option<u8>,
    pub will_topic: Option<String>,
    pub node: Option<NodeKey>,
}

impl SessionOpen {
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            keep_alive_secs: 0,
            bd_seq: None,
            will_topic: None,
            node: None,
        }
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_last_will(mut self, topic: impl Into<String>, bd_seq: Option<u8>) -> Self {
        self.will_topic = Some(topic.into());
        self.bd_seq = bd_seq;
        self
    }

    pub fn with_bd_seq(mut self, bd_seq: u8) -> Self {
        self.bd_seq = Some(bd_seq);
        self
    }

    pub fn with_node(mut self, node: NodeKey) -> Self {
        self.node = Some(node);
        self
    }
}

#[derive(Debug)]
struct SessionEntry {
    state: SessionState,
    last_activity: Instant,
}

/// Session whose node still needs a death published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathCandidate {
    pub client_id: String,
    pub node: NodeKey,
}

/// Result of scanning sessions for missed keep-alives.
#[derive(Debug, Default)]
pub struct StaleScan {
    pub newly_stale: Vec<String>,
    pub pending_deaths: Vec<DeathCandidate>,
}

type Shared<T> = Arc<Mutex<T>>;

pub struct SessionManager<C: Clock> {
    clock: C,
    sessions: RwLock<HashMap<String, Shared<SessionEntry>>>,
}

impl<C: Clock> SessionManager<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, client_id: &str) -> Option<Shared<SessionEntry>> {
        self.sessions.read().get(client_id).cloned()
    }

    /// Record a connect. A retained (non-clean) record for the same client is
    /// resumed and takes the new last-will `bdSeq`.
    pub fn open_session(&self, open: SessionOpen) -> SessionState {
        if !open.clean_session {
            tracing::warn!(
                client_id = %open.client_id,
                "session connected with clean_session=false; sparkplug requires clean sessions"
            );
        }
        let now_ms = self.clock.unix_millis();
        let now = self.clock.now();
        let state = SessionState {
            client_id: open.client_id.clone(),
            connected: true,
            connect_time: Some(now_ms),
            disconnect_time: None,
            clean_session: open.clean_session,
            bd_seq: open.bd_seq,
            keep_alive_secs: open.keep_alive_secs,
            will_topic: open.will_topic,
            node: open.node,
            ndeath_published: false,
            stale: false,
        };
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&open.client_id) {
            let mut entry = existing.lock();
            let previous = entry.state.bd_seq;
            entry.state = state.clone();
            entry.last_activity = now;
            tracing::info!(
                client_id = %open.client_id,
                previous_bd_seq = ?previous,
                bd_seq = ?open.bd_seq,
                "session resumed"
            );
            return state;
        }
        sessions.insert(
            open.client_id,
            Arc::new(Mutex::new(SessionEntry {
                state: state.clone(),
                last_activity: now,
            })),
        );
        state
    }

    /// Mark disconnected. Clean sessions leave no residue; others are kept for
    /// later correlation. Returns the state as of the disconnect.
    pub fn close_session(&self, client_id: &str) -> Option<SessionState> {
        let now_ms = self.clock.unix_millis();
        let mut sessions = self.sessions.write();
        let entry = sessions.get(client_id)?.clone();
        let snapshot = {
            let mut entry = entry.lock();
            entry.state.connected = false;
            entry.state.disconnect_time = Some(now_ms);
            entry.state.clone()
        };
        if snapshot.clean_session {
            sessions.remove(client_id);
        }
        Some(snapshot)
    }

    /// Sparkplug requires a session expiry of exactly zero.
    pub fn validate_session_expiry(interval_secs: u32) -> bool {
        if interval_secs != 0 {
            tracing::warn!(
                interval_secs,
                "session expiry interval must be 0 for sparkplug sessions"
            );
            return false;
        }
        true
    }

    pub fn is_active(&self, client_id: &str) -> bool {
        self.entry(client_id)
            .map(|entry| entry.lock().state.connected)
            .unwrap_or(false)
    }

    pub fn get_session(&self, client_id: &str) -> Option<SessionState> {
        self.entry(client_id).map(|entry| entry.lock().state.clone())
    }

    pub fn all_sessions(&self) -> Vec<SessionState> {
        let entries: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut sessions: Vec<SessionState> =
            entries.iter().map(|e| e.lock().state.clone()).collect();
        sessions.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        sessions
    }

    /// Any inbound packet counts as keep-alive traffic and clears staleness.
    pub fn record_activity(&self, client_id: &str) -> bool {
        let now = self.clock.now();
        match self.entry(client_id) {
            Some(entry) => {
                let mut entry = entry.lock();
                entry.last_activity = now;
                entry.state.stale = false;
                true
            }
            None => false,
        }
    }

    /// Bind the session to the node it just birthed; the new birth has no death yet.
    pub fn bind_node(&self, client_id: &str, node: NodeKey) -> bool {
        match self.entry(client_id) {
            Some(entry) => {
                let mut entry = entry.lock();
                entry.state.node = Some(node);
                entry.state.ndeath_published = false;
                true
            }
            None => false,
        }
    }

    /// Record that a death for `node` went out (explicit NDEATH or synthetic).
    pub fn mark_death_published(&self, node: &NodeKey) -> usize {
        let entries: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut marked = 0;
        for entry in entries {
            let mut entry = entry.lock();
            if entry.state.node.as_ref() == Some(node) && !entry.state.ndeath_published {
                entry.state.ndeath_published = true;
                marked += 1;
            }
        }
        marked
    }

    /// Connected session currently speaking for `node`.
    pub fn session_for_node(&self, node: &NodeKey) -> Option<SessionState> {
        let entries: Vec<_> = self.sessions.read().values().cloned().collect();
        entries
            .iter()
            .map(|e| e.lock().state.clone())
            .find(|s| s.connected && s.node.as_ref() == Some(node))
    }

    /// Flag connected sessions silent for longer than `threshold(keep_alive)`.
    ///
    /// Sessions with a zero keep-alive never go stale. A stale session whose node
    /// has no death yet is reported on every scan until the death is confirmed.
    pub fn scan_stale(&self, threshold: impl Fn(u16) -> Duration) -> StaleScan {
        let now = self.clock.now();
        let entries: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut scan = StaleScan::default();
        for entry in entries {
            let mut entry = entry.lock();
            if !entry.state.connected || entry.state.keep_alive_secs == 0 {
                continue;
            }
            let silent = now.saturating_duration_since(entry.last_activity);
            if silent <= threshold(entry.state.keep_alive_secs) {
                continue;
            }
            if !entry.state.stale {
                entry.state.stale = true;
                scan.newly_stale.push(entry.state.client_id.clone());
            }
            if let (Some(node), false) = (&entry.state.node, entry.state.ndeath_published) {
                scan.pending_deaths.push(DeathCandidate {
                    client_id: entry.state.client_id.clone(),
                    node: node.clone(),
                });
            }
        }
        scan.newly_stale.sort();
        scan
    }

    /// Apply a delivered synthetic death. `take_offline` runs while the
    /// session is held and reports whether the birth the death named was
    /// still current; only then is `ndeath_published` set. A session that
    /// rebound or rebirthed in the meantime keeps its flag clear.
    pub fn confirm_synthetic_death<E>(
        &self,
        candidate: &DeathCandidate,
        take_offline: impl FnOnce() -> Result<bool, E>,
    ) -> Result<bool, E> {
        let Some(entry) = self.entry(&candidate.client_id) else {
            return take_offline();
        };
        let mut entry = entry.lock();
        let applied = take_offline()?;
        if applied && entry.state.node.as_ref() == Some(&candidate.node) {
            entry.state.ndeath_published = true;
        }
        Ok(applied)
    }

    /// Seed a session from a checkpoint; its keep-alive clock restarts now.
    pub fn hydrate(&self, state: SessionState) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&state.client_id) {
            return false;
        }
        sessions.insert(
            state.client_id.clone(),
            Arc::new(Mutex::new(SessionEntry {
                state,
                last_activity: self.clock.now(),
            })),
        );
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
