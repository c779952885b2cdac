//! snowbridge: bounded synchronous command bridge between a game server and an
//! external responder process.
//!
//! Host side: [`BridgeChannel`] owns the connection, [`CommandAdapter`] maps
//! player commands to calls and calls back to player messages.
//! Responder side: [`responder::run_responder`] attaches a [`RequestHandler`].

pub mod adapter;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod responder;

pub use adapter::{CommandAdapter, failure_message};
pub use bridge::transport::Endpoint;
pub use channel::{
    Bridge, BridgeChannel, BridgeRequest, BridgeResponse, ChannelState, ChannelStatus,
    ResponderInfo,
};
pub use config::{BridgeConfig, BusyPolicy, ChannelConfig, ReattachPolicy, ResponderConfig};
pub use error::{BridgeError, BridgeResult, ChannelSetupError};
pub use host::{ActorId, HostMessenger, InvocationEvent, OutputEvent};
pub use responder::{FnHandler, HandlerError, RequestHandler, ResponderError, SessionEnd};
