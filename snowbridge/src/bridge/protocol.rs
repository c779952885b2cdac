//! Wire protocol types for bridge-responder communication.
//!
//! One connection per responder. The responder speaks first (`Attach`), the
//! bridge answers `Attached` or `Rejected`, then the bridge issues `Call`s one
//! at a time and the responder answers each with `Reply` or `Failed`.

use serde::{Deserialize, Serialize};

/// Version carried in the attach handshake. Bumped on incompatible changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifier the bridge assigns to an attached responder.
///
/// UUID v4 so log lines from successive attachments are never confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-channel call sequence number.
///
/// Replies echo it back; a reply whose id does not match the outstanding call
/// belongs to a call that already timed out and is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from the bridge to the responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Handshake accepted; the responder now serves calls.
    Attached { session: SessionId },

    /// Handshake refused. The bridge closes the connection after sending this.
    Rejected { reason: String },

    Call { call_id: CallId, text: String },

    /// The channel is closing; the responder should exit cleanly.
    Shutdown,
}

/// Messages from the responder to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponderMessage {
    /// Must be the first frame on a new connection.
    Attach { name: String, protocol_version: u32 },

    Reply { call_id: CallId, text: String },

    /// The handler could not produce an answer for this call.
    Failed { call_id: CallId, error: String },

    /// Graceful goodbye; treated like a disconnect.
    Detach,
}
