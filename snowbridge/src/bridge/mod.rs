//! Wire layer between the bridge channel (host side) and the responder process.
//!
//! # Architecture
//!
//! - **protocol**: Message types (BridgeMessage, ResponderMessage) and identifiers
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Endpoint addressing, listeners and connectors (TCP, Unix sockets)

pub mod codec;
pub mod protocol;
pub mod transport;
