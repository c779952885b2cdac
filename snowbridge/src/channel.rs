//! Bridge channel manager - owns the connection to the responder process.
//!
//! Lifecycle:
//! 1. `listen()` binds the endpoint and starts the accept loop (`Listening`)
//! 2. A responder connects and sends `attach`; the bridge answers `attached` (`Attached`)
//! 3. `send()` writes one `call` and waits for the matching `reply`, bounded by `call_timeout`
//! 4. On responder loss: back to `Listening` (resilient) or `Closed` (one-shot)
//! 5. `close()` tells the responder to shut down and releases the endpoint (`Closed`, terminal)
//!
//! `open()` is steps 1-2 in one call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    BridgeMessage, CallId, PROTOCOL_VERSION, ResponderMessage, SessionId,
};
use crate::bridge::transport::{BoxedRead, BoxedWrite, BridgeListener, Connection, Endpoint};
use crate::config::{BusyPolicy, ChannelConfig, ReattachPolicy};
use crate::error::{BridgeError, BridgeResult, ChannelSetupError};

type LinkWriter = FramedWrite<BoxedWrite, JsonCodec<BridgeMessage>>;
type LinkReader = FramedRead<BoxedRead, JsonCodec<ResponderMessage>>;

/// Pause after a failed accept (e.g. fd exhaustion) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Connection state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never opened.
    Unestablished,
    /// Endpoint bound, no responder attached.
    Listening,
    /// Responder attached; calls may be issued.
    Attached,
    /// Closed for good.
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unestablished => "unestablished",
            Self::Listening => "listening",
            Self::Attached => "attached",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Text forwarded to the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRequest {
    text: String,
}

impl BridgeRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

impl From<&str> for BridgeRequest {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for BridgeRequest {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Text the responder answered with, unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeResponse {
    text: String,
}

impl BridgeResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// The currently attached responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderInfo {
    pub session: SessionId,
    pub name: String,
    pub peer: String,
}

/// Point-in-time view of the channel for status displays.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub endpoint: Option<Endpoint>,
    pub responder: Option<ResponderInfo>,
}

/// The call primitive the command adapter depends on.
///
/// Lets the adapter be exercised without a real responder process.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn send(&self, request: BridgeRequest) -> BridgeResult<BridgeResponse>;
}

struct PendingCall {
    call_id: CallId,
    reply_tx: oneshot::Sender<BridgeResult<String>>,
}

type PendingSlot = Arc<StdMutex<Option<PendingCall>>>;

struct Link {
    info: ResponderInfo,
    writer: Arc<Mutex<LinkWriter>>,
    pending: PendingSlot,
    /// Stops this link's reader task.
    cancel: CancellationToken,
}

/// State shared between the channel handle and its background tasks.
struct Shared {
    config: ChannelConfig,
    state_tx: watch::Sender<ChannelState>,
    endpoint: StdMutex<Option<Endpoint>>,
    link: StdMutex<Option<Link>>,
    /// Cancelled on close; parent of every link's token.
    shutdown: CancellationToken,
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Bridge mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

impl Shared {
    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Move to `next`. `Closed` is terminal and never left.
    fn set_state(&self, next: ChannelState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == ChannelState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            tracing::debug!(state = %next, "Bridge channel state changed");
        }
    }

    /// Remove the link for `session` (if it is still the current one) and fail
    /// its in-flight call.
    fn detach(&self, session: SessionId, reason: &str) {
        let link = {
            let mut guard = lock(&self.link);
            if guard.as_ref().is_some_and(|l| l.info.session == session) {
                guard.take()
            } else {
                None
            }
        };
        let Some(link) = link else {
            return;
        };

        link.cancel.cancel();
        fail_pending(&link.pending, reason);

        match self.config.reattach_policy {
            ReattachPolicy::Resilient => {
                tracing::info!(%session, reason, "Responder detached, waiting for a new one");
                self.set_state(ChannelState::Listening);
            }
            ReattachPolicy::OneShot => {
                tracing::warn!(%session, reason, "Responder detached, closing one-shot channel");
                lock(&self.endpoint).take();
                self.set_state(ChannelState::Closed);
                self.shutdown.cancel();
            }
        }
    }
}

fn fail_pending(pending: &PendingSlot, reason: &str) {
    if let Some(call) = lock(pending).take() {
        tracing::debug!(call_id = %call.call_id, reason, "Failing in-flight call");
        let _ = call.reply_tx.send(Err(BridgeError::disconnected(reason)));
    }
}

fn complete_pending(pending: &PendingSlot, call_id: CallId, result: BridgeResult<String>) {
    let mut slot = lock(pending);
    match slot.take() {
        Some(call) if call.call_id == call_id => {
            let _ = call.reply_tx.send(result);
        }
        other => {
            *slot = other;
            tracing::warn!(%call_id, "Dropping reply for a call that is no longer waiting");
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    accept_task: Option<JoinHandle<()>>,
}

/// One logical connection to the responder process.
///
/// Create once at bridge bootstrap, share via `Arc`, `close()` at host shutdown.
pub struct BridgeChannel {
    shared: Arc<Shared>,
    /// Serializes open/listen/close.
    lifecycle: Mutex<Lifecycle>,
    /// Held for the whole of a call: one call in flight at a time.
    call_lock: Mutex<()>,
    next_call_id: AtomicU64,
}

impl BridgeChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Unestablished);
        Self {
            shared: Arc::new(Shared {
                config,
                state_tx,
                endpoint: StdMutex::new(None),
                link: StdMutex::new(None),
                shutdown: CancellationToken::new(),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            call_lock: Mutex::new(()),
            next_call_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Watch state transitions (attach, detach, close).
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    /// The bound endpoint, once listening.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        lock(&self.shared.endpoint).clone()
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            state: self.state(),
            endpoint: self.local_endpoint(),
            responder: lock(&self.shared.link).as_ref().map(|l| l.info.clone()),
        }
    }

    /// Bind the endpoint and start accepting responders.
    ///
    /// Idempotent: once listening, returns the already-bound endpoint.
    pub async fn listen(&self) -> Result<Endpoint, ChannelSetupError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() == ChannelState::Closed {
            return Err(ChannelSetupError::Closed);
        }
        if let Some(endpoint) = self.local_endpoint() {
            return Ok(endpoint);
        }

        let configured = &self.shared.config.endpoint;
        let bind_err = |source| ChannelSetupError::Bind {
            endpoint: configured.clone(),
            source,
        };
        let listener = BridgeListener::bind(configured).await.map_err(bind_err)?;
        let endpoint = listener.local_endpoint().map_err(bind_err)?;

        *lock(&self.shared.endpoint) = Some(endpoint.clone());
        self.shared.set_state(ChannelState::Listening);
        lifecycle.accept_task = Some(tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
        )));

        tracing::info!(endpoint = %endpoint, "Bridge listening for responder");
        Ok(endpoint)
    }

    /// Wait until a responder is attached.
    pub async fn wait_attached(&self, wait: Duration) -> Result<(), ChannelSetupError> {
        let mut state_rx = self.subscribe_state();
        let attached = async {
            loop {
                match *state_rx.borrow_and_update() {
                    ChannelState::Attached => return Ok(()),
                    ChannelState::Closed => return Err(ChannelSetupError::Closed),
                    ChannelState::Unestablished | ChannelState::Listening => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(ChannelSetupError::Closed);
                }
            }
        };

        match timeout(wait, attached).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?wait, "No responder attached in time");
                Err(ChannelSetupError::AttachTimeout { timeout: wait })
            }
        }
    }

    /// Listen and block until a responder attaches, bounded by `attach_timeout`.
    ///
    /// A no-op on an already attached channel. On timeout the channel keeps
    /// listening, so a later `open()` or a late responder still succeeds.
    pub async fn open(&self) -> Result<(), ChannelSetupError> {
        if self.state() == ChannelState::Attached {
            return Ok(());
        }
        self.listen().await?;
        self.wait_attached(self.shared.config.attach_timeout).await
    }

    /// Forward one request and wait for its reply.
    pub async fn send(&self, request: BridgeRequest) -> BridgeResult<BridgeResponse> {
        let call_timeout = self.shared.config.call_timeout;
        let deadline = Instant::now() + call_timeout;

        if self.state() != ChannelState::Attached {
            return Err(BridgeError::NotReady);
        }

        let _turn = match self.shared.config.busy_policy {
            BusyPolicy::Reject => self.call_lock.try_lock().map_err(|_| BridgeError::Busy)?,
            BusyPolicy::Queue => timeout_at(deadline, self.call_lock.lock())
                .await
                .map_err(|_| BridgeError::Busy)?,
        };

        let (session, writer, pending) = {
            let link = lock(&self.shared.link);
            let Some(link) = link.as_ref() else {
                return Err(BridgeError::NotReady);
            };
            (
                link.info.session,
                Arc::clone(&link.writer),
                Arc::clone(&link.pending),
            )
        };

        let call_id = CallId(self.next_call_id.fetch_add(1, Ordering::Relaxed));
        let (reply_tx, reply_rx) = oneshot::channel();
        *lock(&pending) = Some(PendingCall { call_id, reply_tx });

        tracing::debug!(%session, %call_id, "Sending call to responder");
        let message = BridgeMessage::Call {
            call_id,
            text: request.into_text(),
        };
        let write = async { writer.lock().await.send(message).await };

        match timeout_at(deadline, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                lock(&pending).take();
                tracing::error!(%session, %call_id, error = %e, "Failed to write call");
                let reason = format!("write failed: {}", e);
                self.shared.detach(session, &reason);
                return Err(BridgeError::disconnected(reason));
            }
            Err(_) => {
                lock(&pending).take();
                return Err(BridgeError::CallTimeout {
                    timeout: call_timeout,
                });
            }
        }

        match timeout_at(deadline, reply_rx).await {
            Ok(Ok(result)) => result.map(BridgeResponse::new),
            Ok(Err(_)) => Err(BridgeError::disconnected("reply channel dropped")),
            Err(_) => {
                lock(&pending).take();
                tracing::warn!(%session, %call_id, timeout = ?call_timeout, "Call timed out");
                Err(BridgeError::CallTimeout {
                    timeout: call_timeout,
                })
            }
        }
    }

    /// Release the endpoint and the responder. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let was_closed = self.state() == ChannelState::Closed;

        self.shared.set_state(ChannelState::Closed);
        self.shared.shutdown.cancel();

        if let Some(task) = lifecycle.accept_task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Accept loop ended abnormally");
        }
        lock(&self.shared.endpoint).take();

        let link = lock(&self.shared.link).take();
        if let Some(link) = link {
            link.cancel.cancel();
            fail_pending(&link.pending, "channel closed");
            let notify = async { link.writer.lock().await.send(BridgeMessage::Shutdown).await };
            match timeout(self.shared.config.handshake_timeout, notify).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Responder gone before shutdown notice"),
                Err(_) => tracing::debug!("Timed out sending shutdown notice"),
            }
        }

        if !was_closed {
            tracing::info!("Bridge channel closed");
        }
    }
}

#[async_trait]
impl Bridge for BridgeChannel {
    async fn send(&self, request: BridgeRequest) -> BridgeResult<BridgeResponse> {
        BridgeChannel::send(self, request).await
    }
}

impl Drop for BridgeChannel {
    fn drop(&mut self) {
        // Background tasks hold `Shared`; stop them so the endpoint is released.
        self.shared.shutdown.cancel();
    }
}

/// Accept connections until shutdown. Each handshake runs in its own task so
/// a peer that stalls before `attach` never holds up the next connection.
async fn accept_loop(shared: Arc<Shared>, listener: BridgeListener) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            Some(done) = handshakes.join_next(), if !handshakes.is_empty() => {
                if let Err(e) = done
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Attach handshake panicked");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    handshakes.spawn(attach_responder(Arc::clone(&shared), conn));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept responder connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    // Abort handshakes still in progress.
    handshakes.shutdown().await;
    tracing::debug!("Accept loop stopped");
}

async fn reject(writer: &mut LinkWriter, peer: &str, reason: String) {
    tracing::warn!(peer, reason = %reason, "Rejecting responder");
    if let Err(e) = writer.send(BridgeMessage::Rejected { reason }).await {
        tracing::debug!(peer, error = %e, "Failed to send rejection");
    }
}

/// Run the attach handshake on a fresh connection and install it as the link.
async fn attach_responder(shared: Arc<Shared>, conn: Connection) {
    let Connection {
        reader,
        writer,
        peer,
    } = conn;
    let mut reader: LinkReader = FramedRead::new(reader, JsonCodec::new());
    let mut writer: LinkWriter = FramedWrite::new(writer, JsonCodec::new());

    tracing::debug!(peer = %peer, "Responder connected, waiting for attach");
    let name = match timeout(shared.config.handshake_timeout, reader.next()).await {
        Ok(Some(Ok(ResponderMessage::Attach {
            name,
            protocol_version,
        }))) => {
            if protocol_version != PROTOCOL_VERSION {
                let reason = format!(
                    "unsupported protocol version {}, expected {}",
                    protocol_version, PROTOCOL_VERSION
                );
                reject(&mut writer, &peer, reason).await;
                return;
            }
            name
        }
        Ok(Some(Ok(other))) => {
            let reason = format!("expected attach as first message, got {:?}", other);
            reject(&mut writer, &peer, reason).await;
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::warn!(peer = %peer, error = %e, "Malformed attach frame");
            return;
        }
        Ok(None) => {
            tracing::debug!(peer = %peer, "Connection closed before attach");
            return;
        }
        Err(_) => {
            reject(&mut writer, &peer, "attach handshake timed out".to_string()).await;
            return;
        }
    };

    let session = SessionId::new();
    let writer = Arc::new(Mutex::new(writer));
    // Held until `attached` is on the wire so no call can overtake it.
    let mut handshake_guard = Arc::clone(&writer).lock_owned().await;
    let pending: PendingSlot = Arc::new(StdMutex::new(None));
    let cancel = shared.shutdown.child_token();

    let refusal = {
        let mut link = lock(&shared.link);
        if shared.state() == ChannelState::Closed {
            Some("channel closed".to_string())
        } else if let Some(current) = link.as_ref() {
            Some(format!(
                "responder {:?} already attached",
                current.info.name
            ))
        } else {
            *link = Some(Link {
                info: ResponderInfo {
                    session,
                    name: name.clone(),
                    peer: peer.clone(),
                },
                writer: Arc::clone(&writer),
                pending: Arc::clone(&pending),
                cancel: cancel.clone(),
            });
            shared.set_state(ChannelState::Attached);
            None
        }
    };

    if let Some(reason) = refusal {
        reject(&mut handshake_guard, &peer, reason).await;
        return;
    }

    if let Err(e) = handshake_guard.send(BridgeMessage::Attached { session }).await {
        drop(handshake_guard);
        shared.detach(session, &format!("handshake write failed: {}", e));
        return;
    }
    drop(handshake_guard);

    tracing::info!(%session, name = %name, peer = %peer, "Responder attached");
    tokio::spawn(read_replies(shared, session, reader, pending, cancel));
}

/// Route responder frames to the waiting call until the link ends.
async fn read_replies(
    shared: Arc<Shared>,
    session: SessionId,
    mut reader: LinkReader,
    pending: PendingSlot,
    cancel: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(ResponderMessage::Reply { call_id, text })) => {
                tracing::trace!(%session, %call_id, "Reply received");
                complete_pending(&pending, call_id, Ok(text));
            }
            Some(Ok(ResponderMessage::Failed { call_id, error })) => {
                tracing::debug!(%session, %call_id, error = %error, "Responder failed call");
                complete_pending(
                    &pending,
                    call_id,
                    Err(BridgeError::Responder { message: error }),
                );
            }
            Some(Ok(ResponderMessage::Detach)) => break "responder detached".to_string(),
            Some(Ok(ResponderMessage::Attach { .. })) => {
                tracing::warn!(%session, "Ignoring repeated attach from attached responder");
            }
            Some(Err(e)) => break format!("transport error: {}", e),
            None => break "connection closed".to_string(),
        }
    };
    shared.detach(session, &reason);
}
