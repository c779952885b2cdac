//! Host-side collaborator types.
//!
//! The game server owns command parsing and message rendering; the bridge only
//! sees who invoked a command, with what text, and where to send the answer.

use std::fmt;

use tokio::sync::mpsc;

/// Keyword the host registers for bridge commands.
pub const COMMAND_KEYWORD: &str = "snowball";

/// Opaque identity of the player (or console) that invoked a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A command invocation delivered by the host's command framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationEvent {
    pub actor: ActorId,
    pub raw_text: String,
}

impl InvocationEvent {
    pub fn new(actor: impl Into<ActorId>, raw_text: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            raw_text: raw_text.into(),
        }
    }
}

/// Text to render to one actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub actor: ActorId,
    pub text: String,
}

impl OutputEvent {
    pub fn new(actor: ActorId, text: impl Into<String>) -> Self {
        Self {
            actor,
            text: text.into(),
        }
    }
}

/// The host's thread-safe messaging facility. Fire-and-forget.
pub trait HostMessenger: Send + Sync {
    fn deliver(&self, event: OutputEvent);
}

impl HostMessenger for mpsc::UnboundedSender<OutputEvent> {
    fn deliver(&self, event: OutputEvent) {
        if let Err(e) = self.send(event) {
            tracing::debug!(actor = %e.0.actor, "Host messenger closed, dropping output");
        }
    }
}

/// Parse `/snowball <text>` the way the host grammar does: the keyword, then
/// one greedy argument running to the end of the line.
///
/// Returns `None` for other commands or a missing argument.
pub fn parse_command(actor: ActorId, line: &str) -> Option<InvocationEvent> {
    let line = line.trim_start();
    let line = line.strip_prefix('/').unwrap_or(line);
    let rest = line.strip_prefix(COMMAND_KEYWORD)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let text = rest.trim_start();
    if text.is_empty() {
        return None;
    }
    Some(InvocationEvent {
        actor,
        raw_text: text.to_string(),
    })
}
