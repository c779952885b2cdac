//! snowbridge-host: console stand-in for the game server.
//!
//! Opens the bridge channel, then reads commands from stdin on a dedicated
//! host dispatch thread:
//!
//! ```text
//! [actor:] /snowball <text>
//! [actor:] /bridge status
//! ```
//!
//! Answers are printed as `[actor] text`.

use std::io::BufRead;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use snowbridge::host::parse_command;
use snowbridge::logging::{LogSettings, init_tracing};
use snowbridge::{
    ActorId, BridgeChannel, BridgeConfig, ChannelStatus, CommandAdapter, HostMessenger,
    OutputEvent,
};

const CONSOLE_ACTOR: &str = "console";

/// Renders host output on stdout.
struct StdoutMessenger;

impl HostMessenger for StdoutMessenger {
    fn deliver(&self, event: OutputEvent) {
        println!("[{}] {}", event.actor, event.text);
    }
}

/// Split an optional `actor:` prefix off a console line.
fn split_actor(line: &str) -> (ActorId, &str) {
    let line = line.trim();
    match line.split_once(':') {
        Some((actor, rest))
            if !actor.is_empty()
                && !actor.starts_with('/')
                && !actor.contains(char::is_whitespace) =>
        {
            (ActorId::new(actor), rest.trim_start())
        }
        _ => (ActorId::new(CONSOLE_ACTOR), line),
    }
}

fn describe(status: &ChannelStatus) -> String {
    let endpoint = status
        .endpoint
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "-".to_string());
    let responder = status
        .responder
        .as_ref()
        .map(|r| format!("{} (session {}, {})", r.name, r.session, r.peer))
        .unwrap_or_else(|| "none".to_string());
    format!(
        "bridge {} on {}, responder: {}",
        status.state, endpoint, responder
    )
}

/// The host dispatch loop. Never blocks on the bridge: calls are handed to the
/// runtime and answered through the messenger. Each dispatched call's handle
/// goes to `in_flight`; dropping the sender at end of input tells `main` that
/// no more calls are coming.
fn host_loop(
    input: impl BufRead,
    runtime: &Handle,
    adapter: &Arc<CommandAdapter>,
    channel: &BridgeChannel,
    messenger: &Arc<dyn HostMessenger>,
    in_flight: mpsc::UnboundedSender<JoinHandle<()>>,
) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let (actor, command) = split_actor(&line);
        if command.trim_start_matches('/') == "bridge status" {
            messenger.deliver(OutputEvent::new(actor, describe(&channel.status())));
            continue;
        }

        match parse_command(actor.clone(), command) {
            Some(event) => {
                let call = adapter.dispatch(runtime, event, Arc::clone(messenger));
                if in_flight.send(call).is_err() {
                    warn!("Shutdown in progress, answer may be lost");
                }
            }
            None => messenger.deliver(OutputEvent::new(
                actor,
                "Unknown command. Try /snowball <text> or /bridge status.",
            )),
        }
    }
}

/// Wait for every dispatched call until the host loop has hung up.
/// Each call is bounded by the channel's call timeout.
async fn drain_in_flight(mut in_flight: mpsc::UnboundedReceiver<JoinHandle<()>>) {
    while let Some(call) = in_flight.recv().await {
        if let Err(e) = call.await {
            warn!(error = %e, "Dispatched call did not finish");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&LogSettings::from_env());
    info!("snowbridge-host {}", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::from_env()?;
    let channel = Arc::new(BridgeChannel::new(config.channel.clone()));

    if let Err(e) = channel.open().await {
        error!(error = %e, "Bridge setup failed");
        channel.close().await;
        return Err(e.into());
    }

    let adapter =
        Arc::new(CommandAdapter::new(channel.clone()).with_prefix(config.response_prefix));
    let messenger: Arc<dyn HostMessenger> = Arc::new(StdoutMessenger);

    let (in_flight_tx, in_flight_rx) = mpsc::unbounded_channel();
    let runtime = Handle::current();
    let host_channel = Arc::clone(&channel);
    std::thread::Builder::new()
        .name("host-dispatch".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            host_loop(
                stdin.lock(),
                &runtime,
                &adapter,
                &host_channel,
                &messenger,
                in_flight_tx,
            );
        })?;

    tokio::select! {
        _ = drain_in_flight(in_flight_rx) => info!("Input closed, shutting down..."),
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
    }

    channel.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    use async_trait::async_trait;
    use snowbridge::{
        Bridge, BridgeRequest, BridgeResponse, BridgeResult, ChannelConfig, ChannelState,
    };

    #[test]
    fn actor_prefix_is_optional() {
        let (actor, command) = split_actor("alex: /snowball build house");
        assert_eq!(actor, ActorId::new("alex"));
        assert_eq!(command, "/snowball build house");

        let (actor, command) = split_actor("/snowball time: noon");
        assert_eq!(actor, ActorId::new(CONSOLE_ACTOR));
        assert_eq!(command, "/snowball time: noon");
    }

    /// Answers after a delay, like a responder that is still thinking when
    /// input ends.
    struct SlowBridge;

    #[async_trait]
    impl Bridge for SlowBridge {
        async fn send(&self, request: BridgeRequest) -> BridgeResult<BridgeResponse> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(BridgeResponse::new(request.text().to_uppercase()))
        }
    }

    #[tokio::test]
    async fn end_of_input_waits_for_dispatched_answers() {
        let adapter = Arc::new(CommandAdapter::new(Arc::new(SlowBridge)));
        let channel = BridgeChannel::new(ChannelConfig::default());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutputEvent>();
        let messenger: Arc<dyn HostMessenger> = Arc::new(out_tx);
        let (in_flight_tx, in_flight_rx) = mpsc::unbounded_channel();

        let input = Cursor::new("alex: /snowball build house\n/snowball generate grass\n");
        host_loop(
            input,
            &Handle::current(),
            &adapter,
            &channel,
            &messenger,
            in_flight_tx,
        );
        // Input is exhausted here; both calls are still sleeping.
        drain_in_flight(in_flight_rx).await;

        let mut answers = vec![out_rx.try_recv().unwrap(), out_rx.try_recv().unwrap()];
        answers.sort_by(|a, b| a.actor.as_str().cmp(b.actor.as_str()));
        assert_eq!(answers[0].actor, ActorId::new("alex"));
        assert_eq!(answers[0].text, "Response: BUILD HOUSE");
        assert_eq!(answers[1].actor, ActorId::new(CONSOLE_ACTOR));
        assert_eq!(answers[1].text, "Response: GENERATE GRASS");
    }

    #[tokio::test]
    async fn status_and_unknown_commands_answer_inline() {
        let adapter = Arc::new(CommandAdapter::new(Arc::new(SlowBridge)));
        let channel = BridgeChannel::new(ChannelConfig::default());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutputEvent>();
        let messenger: Arc<dyn HostMessenger> = Arc::new(out_tx);
        let (in_flight_tx, in_flight_rx) = mpsc::unbounded_channel();

        let input = Cursor::new("/bridge status\nsteve: /dance\n");
        host_loop(
            input,
            &Handle::current(),
            &adapter,
            &channel,
            &messenger,
            in_flight_tx,
        );
        drain_in_flight(in_flight_rx).await;

        let status = out_rx.try_recv().unwrap();
        assert_eq!(status.text, "bridge unestablished on -, responder: none");
        let unknown = out_rx.try_recv().unwrap();
        assert_eq!(unknown.actor, ActorId::new("steve"));
        assert!(unknown.text.starts_with("Unknown command"));
    }

    #[test]
    fn describes_detached_channel() {
        let status = ChannelStatus {
            state: ChannelState::Listening,
            endpoint: Some("127.0.0.1:25333".parse().unwrap()),
            responder: None,
        };
        assert_eq!(
            describe(&status),
            "bridge listening on tcp://127.0.0.1:25333, responder: none"
        );
    }
}
