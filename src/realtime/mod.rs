//! Real-time event fan-out.
//!
//! Connections are admitted with a verified token, auto-joined to their
//! user room, and receive every event broadcast to a room they belong to.

pub mod auth;
pub mod broadcaster;
pub mod room;

pub use auth::{
    extract_token, AuthError, Handshake, Identity, StaticTokenVerifier, TokenVerifier,
    DEFAULT_SESSION_COOKIE,
};
pub use broadcaster::{
    AdmissionError, BroadcastError, Broadcaster, Connection, ConnectionId, RealtimeSettings,
    DEFAULT_CONNECTION_BUFFER,
};
pub use room::Room;
