//! Relay routing core: connection registry plus per-type forwarding rules.
//!
//! ```text
//!            INFO                      close
//! Unregistered ───► Registered ───────────────► Removed
//!      │                │
//!      └─ anything else │ TEXT     → every other registered connection
//!         is dropped    │ REQUEST  → one other registered connection
//!                       │ INITIAL  → requesters, else every other one
//! ```
//!
//! The router holds no document state and performs no I/O. It turns one
//! transport event into a list of [`Outbound`] commands; the server task
//! that owns it carries them out. Forwarded messages are relayed as the
//! exact frame received.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::protocol::{ClientId, Message};

/// Relay-side connection id. Sent to the client as its client id.
pub type ConnectionId = ClientId;

/// Default first connection id.
pub const DEFAULT_BASE_ID: ConnectionId = 100;

/// Bookkeeping for one transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub registered: bool,
    pub username: Option<String>,
    /// Sent REQUEST and has not yet been served an INITIAL.
    awaiting_snapshot: bool,
}

/// Command produced by the router for the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write `frame` to connection `to`.
    Send { to: ConnectionId, frame: Arc<str> },
    /// Close connection `id`.
    Close { id: ConnectionId },
}

/// Routing counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub registered_connections: u64,
    /// Messages forwarded to at least one peer.
    pub messages_routed: u64,
    /// Valid messages with nobody to deliver them to.
    pub messages_unrouted: u64,
    /// Invalid, unregistered, server-only or rejected messages.
    pub messages_dropped: u64,
}

/// The routing state machine. One instance per relay server.
pub struct Router {
    connections: BTreeMap<ConnectionId, ConnectionRecord>,
    next_id: ConnectionId,
    stats: RelayStats,
}

impl Router {
    pub fn new(base_id: ConnectionId) -> Self {
        Self {
            connections: BTreeMap::new(),
            next_id: base_id,
            stats: RelayStats::default(),
        }
    }

    /// Register a new transport connection and allocate its id.
    pub fn connect(&mut self) -> ConnectionId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.connections.insert(
            id,
            ConnectionRecord {
                id,
                registered: false,
                username: None,
                awaiting_snapshot: false,
            },
        );
        self.stats.total_connections += 1;
        self.stats.active_connections += 1;
        log::info!("Connection {id} opened");
        id
    }

    /// Route one text frame received from `from`.
    pub fn receive(&mut self, from: ConnectionId, frame: &str) -> Vec<Outbound> {
        let Some(record) = self.connections.get(&from) else {
            log::warn!("Frame from unknown connection {from}");
            return Vec::new();
        };
        let registered = record.registered;

        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping message from {from}: {e}");
                self.stats.messages_dropped += 1;
                return Vec::new();
            }
        };

        let kind = msg.message_type();
        let forwarded = match msg {
            Message::Info {
                session_share,
                username,
                ..
            } => {
                if registered {
                    log::warn!("Connection {from} sent INFO twice, closing");
                    self.stats.messages_dropped += 1;
                    return vec![Outbound::Close { id: from }];
                }
                if session_share {
                    log::warn!("Connection {from} requested session share, closing");
                    self.stats.messages_dropped += 1;
                    return vec![Outbound::Close { id: from }];
                }
                return self.register(from, username);
            }
            _ if !registered => {
                log::warn!("Dropping {kind:?} from unregistered connection {from}");
                self.stats.messages_dropped += 1;
                return Vec::new();
            }
            Message::Text { .. } => self.to_others(from, frame),
            Message::Request => self.forward_request(from, frame),
            Message::Initial { .. } => self.forward_initial(from, frame),
            Message::Available { .. } | Message::Connect { .. } | Message::Disconnect { .. } => {
                log::warn!("Dropping server-only {kind:?} from connection {from}");
                self.stats.messages_dropped += 1;
                return Vec::new();
            }
        };

        if forwarded.is_empty() {
            log::debug!("No recipient for {kind:?} from connection {from}");
            self.stats.messages_unrouted += 1;
        } else {
            self.stats.messages_routed += 1;
        }
        forwarded
    }

    /// Forget `id` and tell the remaining peers it left.
    pub fn disconnect(&mut self, id: ConnectionId) -> Vec<Outbound> {
        let Some(record) = self.connections.remove(&id) else {
            return Vec::new();
        };
        self.stats.active_connections -= 1;
        log::info!("Connection {id} closed");
        if !record.registered {
            return Vec::new();
        }
        self.stats.registered_connections -= 1;
        match (Message::Disconnect { client_id: id }).encode() {
            Ok(frame) => self.to_others(id, &frame),
            Err(e) => {
                log::error!("Failed to encode DISCONNECT for {id}: {e}");
                Vec::new()
            }
        }
    }

    fn register(&mut self, id: ConnectionId, username: String) -> Vec<Outbound> {
        let is_first = !self.connections.values().any(|c| c.registered && c.id != id);
        if let Some(record) = self.connections.get_mut(&id) {
            record.registered = true;
            record.username = Some(username.clone());
        }
        self.stats.registered_connections += 1;
        log::info!("Connection {id} registered as {username} (first: {is_first})");

        let mut out = Vec::new();
        match Message::available(is_first, id).encode() {
            Ok(frame) => out.push(Outbound::Send {
                to: id,
                frame: frame.into(),
            }),
            Err(e) => log::error!("Failed to encode AVAILABLE for {id}: {e}"),
        }
        match (Message::Connect {
            client_id: id,
            username,
        })
        .encode()
        {
            Ok(frame) => out.extend(self.to_others(id, &frame)),
            Err(e) => log::error!("Failed to encode CONNECT for {id}: {e}"),
        }
        out
    }

    fn others(&self, from: ConnectionId) -> impl Iterator<Item = &ConnectionRecord> + '_ {
        self.connections
            .values()
            .filter(move |c| c.registered && c.id != from)
    }

    fn to_others(&self, from: ConnectionId, frame: &str) -> Vec<Outbound> {
        let frame: Arc<str> = frame.into();
        self.others(from)
            .map(|c| Outbound::Send {
                to: c.id,
                frame: frame.clone(),
            })
            .collect()
    }

    fn forward_request(&mut self, from: ConnectionId, frame: &str) -> Vec<Outbound> {
        let Some(provider) = self.others(from).map(|c| c.id).next() else {
            log::warn!("REQUEST from {from} but no other peer can provide a snapshot");
            return Vec::new();
        };
        if let Some(record) = self.connections.get_mut(&from) {
            record.awaiting_snapshot = true;
        }
        log::debug!("Forwarding REQUEST from {from} to {provider}");
        vec![Outbound::Send {
            to: provider,
            frame: frame.into(),
        }]
    }

    fn forward_initial(&mut self, from: ConnectionId, frame: &str) -> Vec<Outbound> {
        let frame: Arc<str> = frame.into();
        let requesters: Vec<ConnectionId> = self
            .others(from)
            .filter(|c| c.awaiting_snapshot)
            .map(|c| c.id)
            .collect();
        if requesters.is_empty() {
            log::debug!("Broadcasting unsolicited INITIAL from {from}");
            return self.to_others(from, &frame);
        }
        requesters
            .into_iter()
            .map(|to| {
                if let Some(record) = self.connections.get_mut(&to) {
                    record.awaiting_snapshot = false;
                }
                log::debug!("Forwarding INITIAL from {from} to {to}");
                Outbound::Send {
                    to,
                    frame: frame.clone(),
                }
            })
            .collect()
    }

    pub fn record(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.connections.get(&id)
    }

    pub fn registered_count(&self) -> usize {
        self.connections.values().filter(|c| c.registered).count()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_ID)
    }
}
