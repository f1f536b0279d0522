//! Peer session tracking
//!
//! The protocol engine owns the BGP sessions and reports their finite state
//! machine values here. Everything else (the announcer gating advertisements,
//! operator status queries) only reads point-in-time snapshots.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the session tracker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session tracker has not been initialized")]
    Uninitialized,

    #[error("Peer '{0}' not found")]
    PeerNotFound(IpAddr),

    #[error("Unknown session state '{0}'")]
    UnknownState(String),
}

/// BGP peer finite state machine value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        SessionState::Idle,
        SessionState::Connect,
        SessionState::Active,
        SessionState::OpenSent,
        SessionState::OpenConfirm,
        SessionState::Established,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connect => "Connect",
            SessionState::Active => "Active",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        }
    }

    pub fn is_established(&self) -> bool {
        *self == SessionState::Established
    }

    /// Whether the FSM allows moving from `self` to `next`
    ///
    /// Any state may fall back to `Idle`. Used only to flag odd reports from
    /// the protocol engine; the tracker stores whatever it is told.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Idle || next == *self {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Connect)
                | (Connect, Active)
                | (Connect, OpenSent)
                | (Active, Connect)
                | (Active, OpenSent)
                | (OpenSent, OpenConfirm)
                | (OpenSent, Active)
                | (OpenConfirm, Established)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionState::ALL
            .iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| SessionError::UnknownState(s.to_string()))
    }
}

/// A configured remote BGP speaker and its current session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: IpAddr,
    pub asn: u32,
    /// Configuration carried through untouched (hold time, password ref, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub session_state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<DateTime<Utc>>,
}

impl Peer {
    pub fn new(address: IpAddr, asn: u32) -> Self {
        Self {
            address,
            asn,
            attributes: BTreeMap::new(),
            session_state: SessionState::Idle,
            last_transition: None,
        }
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.session_state = state;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Read-only projection of a peer for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub address: String,
    pub session_state: String,
}

impl From<&Peer> for PeerStatus {
    fn from(peer: &Peer) -> Self {
        Self {
            address: peer.address.to_string(),
            session_state: peer.session_state.to_string(),
        }
    }
}

/// Read side of the peer map, as consumed by the announcer and status queries
pub trait SessionSource: Send + Sync {
    /// Point-in-time snapshot in configuration order
    fn list_peers(&self) -> Vec<Peer>;

    fn is_initialized(&self) -> bool {
        true
    }

    /// Projection of [`SessionSource::list_peers`], preserving its order
    fn get_peer_statuses(&self) -> Result<Vec<PeerStatus>, SessionError> {
        if !self.is_initialized() {
            return Err(SessionError::Uninitialized);
        }
        Ok(self.list_peers().iter().map(PeerStatus::from).collect())
    }

    fn established_peers(&self) -> Vec<Peer> {
        self.list_peers()
            .into_iter()
            .filter(|p| p.session_state.is_established())
            .collect()
    }
}

#[derive(Debug, Default)]
struct PeerTable {
    peers: Vec<Peer>,
    index: HashMap<IpAddr, usize>,
}

impl PeerTable {
    fn push_or_replace(&mut self, peer: Peer) {
        match self.index.get(&peer.address) {
            Some(&pos) => {
                if let Some(slot) = self.peers.get_mut(pos) {
                    *slot = peer;
                }
            }
            None => {
                self.index.insert(peer.address, self.peers.len());
                self.peers.push(peer);
            }
        }
    }
}

/// Owner of the peer map
///
/// Reads clone a snapshot under a read lock and never wait on I/O. Writes
/// replace the whole table or a single entry.
#[derive(Debug, Default)]
pub struct SessionTracker {
    table: RwLock<Option<PeerTable>>,
}

impl SessionTracker {
    /// Tracker with no configuration yet; status queries fail until
    /// [`SessionTracker::configure`] is called
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker configured with `peers`
    pub fn with_peers(peers: Vec<Peer>) -> Self {
        let tracker = Self::new();
        tracker.configure(peers);
        tracker
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<PeerTable>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<PeerTable>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the configured peer set, keeping the given order
    ///
    /// Addresses present before and after keep their session state.
    pub fn configure(&self, peers: Vec<Peer>) {
        let mut guard = self.write();
        let previous = guard.take().unwrap_or_default();

        let mut table = PeerTable::default();
        for mut peer in peers {
            if let Some(old) = previous
                .index
                .get(&peer.address)
                .and_then(|&pos| previous.peers.get(pos))
            {
                peer.session_state = old.session_state;
                peer.last_transition = old.last_transition;
            }
            table.push_or_replace(peer);
        }

        info!(peers = table.peers.len(), "Configured BGP peers");
        *guard = Some(table);
    }

    /// Add one peer, or replace the configuration of an existing address
    pub fn add_peer(&self, peer: Peer) {
        let mut guard = self.write();
        let table = guard.get_or_insert_with(PeerTable::default);
        debug!(peer = %peer.address, asn = peer.asn, "Adding BGP peer");
        table.push_or_replace(peer);
    }

    /// Record a new session state for one peer, returning the previous one
    pub fn update_state(
        &self,
        address: IpAddr,
        state: SessionState,
    ) -> Result<SessionState, SessionError> {
        let mut guard = self.write();
        let table = guard.as_mut().ok_or(SessionError::Uninitialized)?;
        let peer = table
            .index
            .get(&address)
            .copied()
            .and_then(|pos| table.peers.get_mut(pos))
            .ok_or(SessionError::PeerNotFound(address))?;

        let previous = peer.session_state;
        if previous == state {
            return Ok(previous);
        }

        if !previous.can_transition_to(state) {
            warn!(
                peer = %address,
                from = %previous,
                to = %state,
                "Unexpected BGP session transition"
            );
        }

        peer.session_state = state;
        peer.last_transition = Some(Utc::now());
        drop(guard);

        if state.is_established() {
            info!(peer = %address, "BGP session established");
        } else if previous.is_established() {
            warn!(peer = %address, state = %state, "BGP session lost");
        } else {
            debug!(peer = %address, from = %previous, to = %state, "BGP session transition");
        }

        Ok(previous)
    }

    pub fn get_peer(&self, address: IpAddr) -> Option<Peer> {
        let guard = self.read();
        let table = guard.as_ref()?;
        table
            .index
            .get(&address)
            .and_then(|&pos| table.peers.get(pos))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.read().as_ref().map(|t| t.peers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionSource for SessionTracker {
    fn list_peers(&self) -> Vec<Peer> {
        self.read()
            .as_ref()
            .map(|t| t.peers.clone())
            .unwrap_or_default()
    }

    fn is_initialized(&self) -> bool {
        self.read().is_some()
    }
}
