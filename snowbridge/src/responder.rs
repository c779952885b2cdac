//! Responder runtime - the external process side of the bridge.
//!
//! The responder connects to the bridge's endpoint, attaches, and then serves
//! calls one at a time until the bridge shuts it down or the connection drops.
//! Supervising the process (start, restart) is left to whoever runs it;
//! [`run_with_reconnect`] only retries the connection.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{BridgeMessage, PROTOCOL_VERSION, ResponderMessage, SessionId};
use crate::bridge::transport::{Endpoint, connect};
use crate::config::ResponderConfig;

/// The handler could not answer a request. Reported to the bridge as `failed`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Computes the reply for one request.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn process(&self, text: String) -> Result<String, HandlerError>;
}

/// Adapts a plain function into a [`RequestHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&str) -> Result<String, HandlerError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&str) -> Result<String, HandlerError> + Send + Sync + 'static,
{
    async fn process(&self, text: String) -> Result<String, HandlerError> {
        (self.0)(&text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("bridge rejected attach: {reason}")]
    Rejected { reason: String },

    #[error("unexpected message during attach: {message}")]
    Handshake { message: String },

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Why a served session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The bridge sent `shutdown`.
    BridgeShutdown,
    /// The local shutdown token fired; a `detach` was sent.
    LocalShutdown,
}

/// Attach once and serve calls until the session ends.
pub async fn run_responder<H: RequestHandler + ?Sized>(
    config: &ResponderConfig,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<SessionEnd, ResponderError> {
    let conn = connect(&config.endpoint)
        .await
        .map_err(|source| ResponderError::Connect {
            endpoint: config.endpoint.clone(),
            source,
        })?;
    let mut reader = FramedRead::new(conn.reader, JsonCodec::<BridgeMessage>::new());
    let mut writer = FramedWrite::new(conn.writer, JsonCodec::<ResponderMessage>::new());

    writer
        .send(ResponderMessage::Attach {
            name: config.name.clone(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await?;

    let session: SessionId = match reader.next().await {
        Some(Ok(BridgeMessage::Attached { session })) => session,
        Some(Ok(BridgeMessage::Rejected { reason })) => {
            return Err(ResponderError::Rejected { reason });
        }
        Some(Ok(other)) => {
            return Err(ResponderError::Handshake {
                message: format!("{:?}", other),
            });
        }
        Some(Err(e)) => return Err(e.into()),
        None => {
            return Err(ResponderError::ConnectionLost {
                reason: "bridge closed the connection during attach".to_string(),
            });
        }
    };
    tracing::info!(%session, endpoint = %config.endpoint, name = %config.name, "Attached to bridge");

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(%session, "Detaching from bridge");
                writer.send(ResponderMessage::Detach).await?;
                return Ok(SessionEnd::LocalShutdown);
            }
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(BridgeMessage::Call { call_id, text })) => {
                tracing::debug!(%session, %call_id, "Processing call");
                let reply = match handler.process(text).await {
                    Ok(text) => ResponderMessage::Reply { call_id, text },
                    Err(e) => {
                        tracing::warn!(%session, %call_id, error = %e, "Handler failed");
                        ResponderMessage::Failed {
                            call_id,
                            error: e.message,
                        }
                    }
                };
                writer.send(reply).await?;
            }
            Some(Ok(BridgeMessage::Shutdown)) => {
                tracing::info!(%session, "Bridge requested shutdown");
                return Ok(SessionEnd::BridgeShutdown);
            }
            Some(Ok(other)) => {
                tracing::warn!(%session, message = ?other, "Ignoring unexpected message");
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ResponderError::ConnectionLost {
                    reason: "bridge closed the connection".to_string(),
                });
            }
        }
    }
}

/// Keep attaching until the local shutdown token fires.
///
/// The bridge going away (or not being up yet) is expected: wait
/// `reconnect_delay` and try again.
pub async fn run_with_reconnect<H: RequestHandler + ?Sized>(
    config: &ResponderConfig,
    handler: Arc<H>,
    shutdown: CancellationToken,
) {
    loop {
        match run_responder(config, Arc::clone(&handler), shutdown.clone()).await {
            Ok(SessionEnd::LocalShutdown) => return,
            Ok(SessionEnd::BridgeShutdown) => {
                tracing::info!(delay = ?config.reconnect_delay, "Bridge shut down, will reattach");
            }
            Err(e) => {
                tracing::warn!(error = %e, delay = ?config.reconnect_delay, "Responder session ended");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CallId;
    use crate::bridge::transport::BridgeListener;

    #[tokio::test]
    async fn fn_handler_calls_through() {
        let handler = FnHandler::new(|text: &str| Ok(text.chars().rev().collect()));
        assert_eq!(handler.process("abc".to_string()).await.unwrap(), "cba");
    }

    #[tokio::test]
    async fn connect_failure_names_endpoint() {
        // Bind then drop to get a port nothing listens on.
        let endpoint = {
            let listener = BridgeListener::bind(&"127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
            listener.local_endpoint().unwrap()
        };
        let config = ResponderConfig {
            endpoint: endpoint.clone(),
            ..ResponderConfig::default()
        };
        let handler = Arc::new(FnHandler::new(|t: &str| Ok(t.to_string())));

        let err = run_responder(&config, handler, CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ResponderError::Connect { endpoint: e, .. } => assert_eq!(e, endpoint),
            other => panic!("expected connect error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn serves_calls_and_reports_handler_failures() {
        let listener = BridgeListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let config = ResponderConfig {
            endpoint: listener.local_endpoint().unwrap(),
            ..ResponderConfig::default()
        };
        let handler = Arc::new(FnHandler::new(|text: &str| match text {
            "fail" => Err(HandlerError::new("cannot do that")),
            other => Ok(format!("ok:{}", other)),
        }));
        let responder = tokio::spawn(async move {
            run_responder(&config, handler, CancellationToken::new()).await
        });

        // Play the bridge by hand.
        let conn = listener.accept().await.unwrap();
        let mut reader = FramedRead::new(conn.reader, JsonCodec::<ResponderMessage>::new());
        let mut writer = FramedWrite::new(conn.writer, JsonCodec::<BridgeMessage>::new());

        match reader.next().await {
            Some(Ok(ResponderMessage::Attach {
                name,
                protocol_version,
            })) => {
                assert_eq!(name, "snowball");
                assert_eq!(protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("expected attach, got {:?}", other),
        }
        writer
            .send(BridgeMessage::Attached {
                session: SessionId::new(),
            })
            .await
            .unwrap();

        writer
            .send(BridgeMessage::Call {
                call_id: CallId(1),
                text: "hello".to_string(),
            })
            .await
            .unwrap();
        match reader.next().await {
            Some(Ok(ResponderMessage::Reply { call_id, text })) => {
                assert_eq!(call_id, CallId(1));
                assert_eq!(text, "ok:hello");
            }
            other => panic!("expected reply, got {:?}", other),
        }

        writer
            .send(BridgeMessage::Call {
                call_id: CallId(2),
                text: "fail".to_string(),
            })
            .await
            .unwrap();
        match reader.next().await {
            Some(Ok(ResponderMessage::Failed { call_id, error })) => {
                assert_eq!(call_id, CallId(2));
                assert_eq!(error, "cannot do that");
            }
            other => panic!("expected failure, got {:?}", other),
        }

        writer.send(BridgeMessage::Shutdown).await.unwrap();
        assert_eq!(
            responder.await.unwrap().unwrap(),
            SessionEnd::BridgeShutdown
        );
    }

    #[tokio::test]
    async fn rejection_is_an_error() {
        let listener = BridgeListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let config = ResponderConfig {
            endpoint: listener.local_endpoint().unwrap(),
            ..ResponderConfig::default()
        };
        let handler = Arc::new(FnHandler::new(|t: &str| Ok(t.to_string())));
        let responder = tokio::spawn(async move {
            run_responder(&config, handler, CancellationToken::new()).await
        });

        let conn = listener.accept().await.unwrap();
        let mut reader = FramedRead::new(conn.reader, JsonCodec::<ResponderMessage>::new());
        let mut writer = FramedWrite::new(conn.writer, JsonCodec::<BridgeMessage>::new());
        let _attach = reader.next().await;
        writer
            .send(BridgeMessage::Rejected {
                reason: "responder \"other\" already attached".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            responder.await.unwrap(),
            Err(ResponderError::Rejected { .. })
        ));
    }
}
