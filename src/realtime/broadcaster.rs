//! Room-based event fan-out to live connections.
//!
//! Each admitted connection owns a bounded buffer. Broadcasting never
//! blocks: an event for a full or closed buffer is dropped for that
//! connection only. There is no replay, so a subscriber that is not
//! connected simply misses the event.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::domain::{EventKind, RealtimeEvent};

use super::auth::{extract_token, AuthError, Handshake, Identity, TokenVerifier, DEFAULT_SESSION_COOKIE};
use super::room::Room;

/// Default per-connection buffer capacity
pub const DEFAULT_CONNECTION_BUFFER: usize = 256;

/// Broadcaster settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeSettings {
    /// Cookie consulted when the handshake has no auth field
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    /// Events buffered per connection before new ones are dropped
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,
}

fn default_session_cookie() -> String {
    DEFAULT_SESSION_COOKIE.to_string()
}

fn default_connection_buffer() -> usize {
    DEFAULT_CONNECTION_BUFFER
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            session_cookie: default_session_cookie(),
            connection_buffer: default_connection_buffer(),
        }
    }
}

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection was refused
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("No token presented")]
    MissingToken,

    #[error("Token verification failed: {0}")]
    InvalidToken(#[source] AuthError),

    #[error("Broadcaster is shut down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

struct ConnectionEntry {
    identity: Identity,
    sender: mpsc::Sender<Arc<RealtimeEvent>>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
    closed: bool,
}

impl Registry {
    fn join(&mut self, id: ConnectionId, room: Room) -> Result<bool, BroadcastError> {
        let entry = self
            .connections
            .get_mut(&id)
            .ok_or(BroadcastError::UnknownConnection(id))?;
        let added = entry.rooms.insert(room.clone());
        self.rooms.entry(room).or_default().insert(id);
        Ok(added)
    }

    fn leave(&mut self, id: ConnectionId, room: &Room) -> Result<bool, BroadcastError> {
        let entry = self
            .connections
            .get_mut(&id)
            .ok_or(BroadcastError::UnknownConnection(id))?;
        let removed = entry.rooms.remove(room);
        self.drop_member(room, id);
        Ok(removed)
    }

    fn remove(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&id)?;
        for room in &entry.rooms {
            self.drop_member(room, id);
        }
        Some(entry)
    }

    fn drop_member(&mut self, room: &Room, id: ConnectionId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }
}

struct Shared {
    registry: RwLock<Registry>,
    verifier: Arc<dyn TokenVerifier>,
    settings: RealtimeSettings,
    next_id: AtomicU64,
}

impl Shared {
    // A panic while holding the lock leaves the maps consistent, so poisoning is ignored
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fan-out hub shared by everything that creates connections or emits events
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self::with_settings(verifier, RealtimeSettings::default())
    }

    pub fn with_settings(verifier: Arc<dyn TokenVerifier>, settings: RealtimeSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry::default()),
                verifier,
                settings,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.shared.settings
    }

    /// Admit a connection; on success it is already a member of its user room
    pub async fn connect(&self, handshake: &Handshake) -> Result<Connection, AdmissionError> {
        if self.is_shut_down() {
            return Err(AdmissionError::ShuttingDown);
        }

        let token = extract_token(handshake, &self.shared.settings.session_cookie)
            .ok_or(AdmissionError::MissingToken)?;

        let identity = self.shared.verifier.verify(&token).await.map_err(|e| {
            warn!(error = %e, "Connection refused");
            AdmissionError::InvalidToken(e)
        })?;

        let id = ConnectionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.shared.settings.connection_buffer.max(1));
        let user_room = Room::user(&identity.user_id);

        {
            let mut registry = self.shared.write();
            if registry.closed {
                return Err(AdmissionError::ShuttingDown);
            }
            registry.connections.insert(
                id,
                ConnectionEntry {
                    identity: identity.clone(),
                    sender,
                    rooms: HashSet::new(),
                },
            );
            registry
                .join(id, user_room.clone())
                .map_err(|_| AdmissionError::ShuttingDown)?;
        }

        info!(connection = %id, user = %identity.user_id, "Connection admitted");

        Ok(Connection {
            id,
            identity,
            receiver,
            broadcaster: Arc::downgrade(&self.shared),
        })
    }

    /// Subscribe a connection to `room`; returns false if it was already a member
    pub fn join(&self, connection: ConnectionId, room: impl Into<Room>) -> Result<bool, BroadcastError> {
        let room = room.into();
        let added = self.shared.write().join(connection, room.clone())?;
        debug!(%connection, %room, "Joined room");
        Ok(added)
    }

    /// Unsubscribe a connection from `room`; returns false if it was not a member
    pub fn leave(&self, connection: ConnectionId, room: impl Into<Room>) -> Result<bool, BroadcastError> {
        let room = room.into();
        let removed = self.shared.write().leave(connection, &room)?;
        debug!(%connection, %room, "Left room");
        Ok(removed)
    }

    /// Deliver an event to every current member of `room`
    ///
    /// Returns how many connections accepted it. An empty room is a no-op.
    pub fn broadcast(&self, room: &Room, kind: EventKind, payload: serde_json::Value) -> usize {
        let registry = self.shared.read();
        let Some(members) = registry.rooms.get(room) else {
            return 0;
        };

        let event = Arc::new(RealtimeEvent::new(kind, room.as_str(), payload));
        let mut delivered = 0;

        for id in members {
            let Some(entry) = registry.connections.get(id) else {
                continue;
            };
            match entry.sender.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(connection = %id, %room, %kind, "Connection buffer full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = %id, %room, %kind, "Connection closed, event dropped");
                }
            }
        }

        delivered
    }

    /// Send a generic notification to a user's room
    pub fn notify_user(&self, user_id: &str, payload: serde_json::Value) -> usize {
        self.broadcast(&Room::user(user_id), EventKind::GenericNotification, payload)
    }

    /// Current members of `room`
    pub fn members(&self, room: &Room) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .shared
            .read()
            .rooms
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Rooms `connection` belongs to
    pub fn rooms_of(&self, connection: ConnectionId) -> Vec<Room> {
        let mut rooms: Vec<Room> = self
            .shared
            .read()
            .connections
            .get(&connection)
            .map(|e| e.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn identity_of(&self, connection: ConnectionId) -> Option<Identity> {
        self.shared
            .read()
            .connections
            .get(&connection)
            .map(|e| e.identity.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.shared.read().connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.shared.read().rooms.len()
    }

    /// Drop a connection and all its memberships; returns false if unknown
    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        let removed = self.shared.write().remove(connection).is_some();
        if removed {
            debug!(%connection, "Connection removed");
        }
        removed
    }

    /// Refuse new connections and close every open one
    pub fn shutdown(&self) {
        let mut registry = self.shared.write();
        registry.closed = true;
        let count = registry.connections.len();
        registry.connections.clear();
        registry.rooms.clear();
        info!(connections = count, "Broadcaster shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.read().closed
    }
}

/// An admitted connection and its event stream
///
/// Dropping it leaves every room it joined.
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    receiver: mpsc::Receiver<Arc<RealtimeEvent>>,
    broadcaster: Weak<Shared>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_room(&self) -> Room {
        Room::user(&self.identity.user_id)
    }

    /// Next event; `None` once the broadcaster has dropped this connection
    pub async fn recv(&mut self) -> Option<Arc<RealtimeEvent>> {
        self.receiver.recv().await
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<Arc<RealtimeEvent>> {
        self.receiver.try_recv().ok()
    }

    pub fn close(self) {}
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(shared) = self.broadcaster.upgrade() {
            shared.write().remove(self.id);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::StaticTokenVerifier;
    use serde_json::json;

    fn broadcaster() -> Broadcaster {
        let verifier = StaticTokenVerifier::new()
            .with_token("tok-a", "alice")
            .with_token("tok-b", "bob");
        Broadcaster::new(Arc::new(verifier))
    }

    #[tokio::test]
    async fn test_connect_joins_user_room() {
        let hub = broadcaster();
        let conn = hub.connect(&Handshake::with_token("tok-a")).await.unwrap();

        assert_eq!(hub.rooms_of(conn.id()), vec![Room::user("alice")]);
        assert_eq!(hub.notify_user("alice", json!({"msg": "hi"})), 1);
    }

    #[tokio::test]
    async fn test_full_buffer_drops() {
        let verifier = StaticTokenVerifier::new().with_token("tok-a", "alice");
        let settings = RealtimeSettings {
            connection_buffer: 1,
            ..Default::default()
        };
        let hub = Broadcaster::with_settings(Arc::new(verifier), settings);
        let mut conn = hub.connect(&Handshake::with_token("tok-a")).await.unwrap();
        let room = conn.user_room();

        assert_eq!(hub.broadcast(&room, EventKind::GenericNotification, json!(1)), 1);
        assert_eq!(hub.broadcast(&room, EventKind::GenericNotification, json!(2)), 0);

        let first = conn.try_recv().unwrap();
        assert_eq!(first.payload, json!(1));
        assert!(conn.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_leave_and_unknown_connection() {
        let hub = broadcaster();
        let conn = hub.connect(&Handshake::with_token("tok-b")).await.unwrap();

        assert!(hub.join(conn.id(), "channel:9").unwrap());
        assert!(!hub.join(conn.id(), "channel:9").unwrap());
        assert!(hub.leave(conn.id(), "channel:9").unwrap());
        assert!(hub.members(&Room::channel(9)).is_empty());

        let id = conn.id();
        drop(conn);
        assert_eq!(hub.join(id, "channel:9"), Err(BroadcastError::UnknownConnection(id)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let hub = broadcaster();
        let mut conn = hub.connect(&Handshake::with_token("tok-a")).await.unwrap();

        hub.shutdown();

        assert!(conn.recv().await.is_none());
        assert!(matches!(
            hub.connect(&Handshake::with_token("tok-a")).await,
            Err(AdmissionError::ShuttingDown)
        ));
    }
}
