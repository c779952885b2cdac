//! Command adapter: one host invocation in, one host output out.
//!
//! This is the fault boundary between the bridge and the host's command
//! dispatch. Every bridge failure becomes a message for the invoking actor;
//! nothing propagates into the host.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::channel::{Bridge, BridgeRequest};
use crate::config::DEFAULT_RESPONSE_PREFIX;
use crate::error::BridgeError;
use crate::host::{HostMessenger, InvocationEvent, OutputEvent};

pub const EMPTY_INPUT_MESSAGE: &str = "Nothing to send: add some text after the command.";

/// Message shown to the actor for a failed call.
pub fn failure_message(err: &BridgeError) -> String {
    match err {
        BridgeError::NotReady => {
            "Not connected: no responder is attached to the bridge.".to_string()
        }
        BridgeError::Disconnected { .. } => {
            "Disconnected: the responder went away before answering.".to_string()
        }
        BridgeError::CallTimeout { timeout } => {
            format!("Timed out: no answer within {} ms.", timeout.as_millis())
        }
        BridgeError::Busy => "Busy: another command is in progress, try again.".to_string(),
        BridgeError::Responder { message } => format!("No answer: {}", message),
    }
}

pub struct CommandAdapter {
    bridge: Arc<dyn Bridge>,
    prefix: String,
}

impl CommandAdapter {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Self {
            bridge,
            prefix: DEFAULT_RESPONSE_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Forward the invocation and build the actor's answer. Never fails.
    pub async fn handle(&self, event: InvocationEvent) -> OutputEvent {
        let InvocationEvent { actor, raw_text } = event;

        if raw_text.trim().is_empty() {
            return OutputEvent::new(actor, EMPTY_INPUT_MESSAGE);
        }

        match self.bridge.send(BridgeRequest::new(raw_text)).await {
            Ok(response) => {
                tracing::debug!(actor = %actor, "Bridge call succeeded");
                OutputEvent::new(actor, format!("{}{}", self.prefix, response.text()))
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::info!(actor = %actor, error = %err, "Bridge call failed");
                } else {
                    tracing::warn!(actor = %actor, error = %err, "Bridge call failed");
                }
                OutputEvent::new(actor, failure_message(&err))
            }
        }
    }

    /// Blocking form for a host dispatch thread.
    ///
    /// Blocks the caller for at most the channel's call timeout. Must not be
    /// called from inside the runtime's own worker threads.
    pub fn handle_blocking(&self, runtime: &Handle, event: InvocationEvent) -> OutputEvent {
        runtime.block_on(self.handle(event))
    }

    /// Hand the invocation off to the runtime and deliver the answer through
    /// the host messenger when it is ready. Returns immediately.
    pub fn dispatch(
        self: &Arc<Self>,
        runtime: &Handle,
        event: InvocationEvent,
        messenger: Arc<dyn HostMessenger>,
    ) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        runtime.spawn(async move {
            let output = adapter.handle(event).await;
            messenger.deliver(output);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::channel::BridgeResponse;
    use crate::error::BridgeResult;
    use crate::host::ActorId;

    /// Bridge double: answers from a fixed result and records requests.
    struct MockBridge {
        result: BridgeResult<String>,
        seen: Mutex<Vec<String>>,
    }

    impl MockBridge {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                result: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(err: BridgeError) -> Arc<Self> {
            Arc::new(Self {
                result: Err(err),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Bridge for MockBridge {
        async fn send(&self, request: BridgeRequest) -> BridgeResult<BridgeResponse> {
            self.seen.lock().unwrap().push(request.into_text());
            self.result.clone().map(BridgeResponse::new)
        }
    }

    fn invocation(text: &str) -> InvocationEvent {
        InvocationEvent::new("alex", text)
    }

    #[tokio::test]
    async fn success_is_prefixed_and_addressed_to_actor() {
        let bridge = MockBridge::replying("world");
        let adapter = CommandAdapter::new(bridge.clone());

        let output = adapter.handle(invocation("hello")).await;

        assert_eq!(output.actor, ActorId::new("alex"));
        assert_eq!(output.text, "Response: world");
        assert_eq!(bridge.seen(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn custom_prefix_is_used() {
        let adapter = CommandAdapter::new(MockBridge::replying("Building house..."))
            .with_prefix("Snowball Response: ");

        let output = adapter.handle(invocation("build house")).await;
        assert_eq!(output.text, "Snowball Response: Building house...");
    }

    #[tokio::test]
    async fn failures_become_distinct_messages() {
        let cases = [
            (BridgeError::NotReady, "Not connected"),
            (BridgeError::disconnected("eof"), "Disconnected"),
            (
                BridgeError::CallTimeout {
                    timeout: Duration::from_millis(1500),
                },
                "Timed out: no answer within 1500 ms.",
            ),
            (BridgeError::Busy, "try again"),
            (
                BridgeError::Responder {
                    message: "model not loaded".to_string(),
                },
                "No answer: model not loaded",
            ),
        ];

        let mut texts = Vec::new();
        for (err, expected) in cases {
            let adapter = CommandAdapter::new(MockBridge::failing(err));
            let output = adapter.handle(invocation("hello")).await;
            assert_eq!(output.actor, ActorId::new("alex"));
            assert!(output.text.contains(expected), "{:?}", output.text);
            texts.push(output.text);
        }
        texts.sort();
        texts.dedup();
        assert_eq!(texts.len(), 5);
    }

    #[tokio::test]
    async fn blank_input_never_reaches_the_bridge() {
        let bridge = MockBridge::replying("unused");
        let adapter = CommandAdapter::new(bridge.clone());

        let output = adapter.handle(invocation("   ")).await;

        assert_eq!(output.text, EMPTY_INPUT_MESSAGE);
        assert!(bridge.seen().is_empty());
    }

    #[tokio::test]
    async fn dispatch_delivers_through_messenger() {
        let adapter = Arc::new(CommandAdapter::new(MockBridge::replying("world")));
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputEvent>();

        adapter
            .dispatch(&Handle::current(), invocation("hello"), Arc::new(tx))
            .await
            .unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.actor, ActorId::new("alex"));
        assert_eq!(delivered.text, "Response: world");
    }

    #[test]
    fn handle_blocking_runs_on_a_plain_thread() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let adapter = CommandAdapter::new(MockBridge::failing(BridgeError::NotReady));

        let output = adapter.handle_blocking(runtime.handle(), invocation("hello"));

        assert!(output.text.starts_with("Not connected"));
    }
}
