//! Runtime configuration for both sides of the bridge.
//!
//! Defaults suit a loopback deployment; every field can be overridden from
//! `SNOWBRIDGE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::bridge::transport::{Endpoint, EndpointParseError};

pub const ENV_ENDPOINT: &str = "SNOWBRIDGE_ENDPOINT";
pub const ENV_CALL_TIMEOUT_MS: &str = "SNOWBRIDGE_CALL_TIMEOUT_MS";
pub const ENV_ATTACH_TIMEOUT_MS: &str = "SNOWBRIDGE_ATTACH_TIMEOUT_MS";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "SNOWBRIDGE_HANDSHAKE_TIMEOUT_MS";
pub const ENV_BUSY_POLICY: &str = "SNOWBRIDGE_BUSY_POLICY";
pub const ENV_REATTACH: &str = "SNOWBRIDGE_REATTACH";
pub const ENV_RESPONSE_PREFIX: &str = "SNOWBRIDGE_RESPONSE_PREFIX";
pub const ENV_RESPONDER_NAME: &str = "SNOWBRIDGE_RESPONDER_NAME";
pub const ENV_RECONNECT_MS: &str = "SNOWBRIDGE_RECONNECT_MS";

pub const DEFAULT_RESPONSE_PREFIX: &str = "Response: ";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: {source}")]
    Endpoint {
        var: &'static str,
        #[source]
        source: EndpointParseError,
    },
    #[error("{var}: expected milliseconds, got {value:?}")]
    Millis { var: &'static str, value: String },
    #[error("{var}: expected one of {expected}, got {value:?}")]
    Choice {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// What a call does when another call already holds the channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Wait for the channel, within the caller's own call deadline.
    #[default]
    Queue,
    /// Fail immediately with `BridgeError::Busy`.
    Reject,
}

impl FromStr for BusyPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            _ => Err(()),
        }
    }
}

/// What the channel does when its responder goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReattachPolicy {
    /// Go back to `Listening` and accept the next responder.
    #[default]
    Resilient,
    /// Close the channel; a new channel must be built.
    OneShot,
}

impl FromStr for ReattachPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resilient" => Ok(Self::Resilient),
            "one-shot" | "oneshot" | "one_shot" => Ok(Self::OneShot),
            _ => Err(()),
        }
    }
}

/// Bridge channel settings (host side).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: Endpoint,
    /// Upper bound on a whole `send`, including time spent queued.
    pub call_timeout: Duration,
    /// How long `open()` waits for a responder to attach.
    pub attach_timeout: Duration,
    /// How long a freshly accepted connection has to send its `attach` frame.
    pub handshake_timeout: Duration,
    pub busy_policy: BusyPolicy,
    pub reattach_policy: ReattachPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            call_timeout: Duration::from_secs(5),
            attach_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(2),
            busy_policy: BusyPolicy::default(),
            reattach_policy: ReattachPolicy::default(),
        }
    }
}

/// Host-side settings: the channel plus how replies are rendered.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub channel: ChannelConfig,
    pub response_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            response_prefix: DEFAULT_RESPONSE_PREFIX.to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let channel = &mut config.channel;

        if let Some(v) = lookup(ENV_ENDPOINT) {
            channel.endpoint = parse_endpoint(ENV_ENDPOINT, &v)?;
        }
        if let Some(v) = lookup(ENV_CALL_TIMEOUT_MS) {
            channel.call_timeout = parse_millis(ENV_CALL_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_ATTACH_TIMEOUT_MS) {
            channel.attach_timeout = parse_millis(ENV_ATTACH_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_HANDSHAKE_TIMEOUT_MS) {
            channel.handshake_timeout = parse_millis(ENV_HANDSHAKE_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_BUSY_POLICY) {
            channel.busy_policy = v.parse().map_err(|_| ConfigError::Choice {
                var: ENV_BUSY_POLICY,
                expected: "queue, reject",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup(ENV_REATTACH) {
            channel.reattach_policy = v.parse().map_err(|_| ConfigError::Choice {
                var: ENV_REATTACH,
                expected: "resilient, one-shot",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup(ENV_RESPONSE_PREFIX) {
            config.response_prefix = v;
        }

        Ok(config)
    }
}

/// Responder-side settings.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub endpoint: Endpoint,
    /// Name announced in the attach handshake.
    pub name: String,
    /// Delay between attach attempts when the bridge is unreachable or goes away.
    pub reconnect_delay: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            name: "snowball".to_string(),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl ResponderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_ENDPOINT) {
            config.endpoint = parse_endpoint(ENV_ENDPOINT, &v)?;
        }
        if let Some(v) = lookup(ENV_RESPONDER_NAME) {
            config.name = v;
        }
        if let Some(v) = lookup(ENV_RECONNECT_MS) {
            config.reconnect_delay = parse_millis(ENV_RECONNECT_MS, &v)?;
        }
        Ok(config)
    }
}

fn parse_endpoint(var: &'static str, value: &str) -> Result<Endpoint, ConfigError> {
    value
        .parse()
        .map_err(|source| ConfigError::Endpoint { var, source })
}

fn parse_millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::Millis {
            var,
            value: value.to_string(),
        })
}
