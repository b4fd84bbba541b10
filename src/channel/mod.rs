//! Request/response channel over one persistent connection.
//!
//! [`ChannelClient`] owns a single duplex connection to the bot service,
//! tags every outbound request with a correlation id and resolves the waiting
//! caller when the matching reply arrives. Lost connections are re-opened on
//! a fixed delay, up to a bounded number of attempts.
//!
//! ```text
//! Idle --connect--> Connecting --ok--> Open --remote close/error--> Closed
//!                        ^                                            |
//!                        +------- after reconnect_delay, if budget ---+
//! Open --close()--> Closed   (no automatic reconnect)
//! ```

mod error;
pub mod transport;

pub use error::ChannelError;
pub use transport::{
    AcceptMode, Connector, MemoryConnector, MemoryListener, MemoryPeer, Transport, WsConnector,
};

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::timer::Timer;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Timing and retry parameters for a [`ChannelClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Deadline for a connection attempt to reach `Open`.
    pub connect_timeout: Duration,
    /// Deadline for a reply to a single request.
    pub response_timeout: Duration,
    /// Fixed delay before each automatic reconnect.
    pub reconnect_delay: Duration,
    /// Automatic reconnects allowed since the last successful open.
    pub max_reconnect_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Lifecycle of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Point-in-time view of the client, published on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    /// The reconnect budget is spent; only an explicit `connect()` retries.
    pub exhausted: bool,
    pub pending: usize,
}

type ConnectOutcome = Shared<BoxFuture<'static, Result<(), ChannelError>>>;
type Reply = Result<serde_json::Value, ChannelError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Public `connect()`: starts over with a fresh reconnect budget.
    Explicit,
    /// A request found the channel down. Counts against the budget.
    OnDemand,
    /// Fired by the reconnect timer.
    Reconnect,
}

struct Pending {
    action: String,
    created: Instant,
    reply: oneshot::Sender<Reply>,
}

/// Handles to the I/O task of an open connection.
struct Link {
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

struct State {
    phase: ConnectionState,
    attempt: Option<ConnectOutcome>,
    link: Option<Link>,
    pending: HashMap<u64, Pending>,
    next_id: u64,
    reconnect_attempts: u32,
    exhausted: bool,
    reconnect_timer: Option<Timer>,
    /// Bumped by every connect attempt and by `close()`. Background tasks
    /// carry the epoch they were started in and back off once it moved on.
    epoch: u64,
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
    status_tx: watch::Sender<ChannelStatus>,
}

/// Cloneable handle to one channel. All clones share the connection and
/// the pending-request table.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
}

impl ChannelClient {
    pub fn new(connector: impl Connector, config: ChannelConfig) -> Self {
        let initial = ChannelStatus {
            state: ConnectionState::Idle,
            reconnect_attempts: 0,
            exhausted: false,
            pending: 0,
        };
        let (status_tx, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                config,
                connector: Arc::new(connector),
                state: Mutex::new(State {
                    phase: ConnectionState::Idle,
                    attempt: None,
                    link: None,
                    pending: HashMap::new(),
                    next_id: 0,
                    reconnect_attempts: 0,
                    exhausted: false,
                    reconnect_timer: None,
                    epoch: 0,
                }),
                status_tx,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    pub fn status(&self) -> ChannelStatus {
        *self.inner.status_tx.borrow()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Open the connection, or join the attempt already in flight.
    ///
    /// Returns immediately when already open. Starting a fresh attempt from
    /// here resets the reconnect budget and cancels a scheduled reconnect.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.open(Trigger::Explicit).await
    }

    async fn open(&self, trigger: Trigger) -> Result<(), ChannelError> {
        let outcome = {
            let mut state = self.inner.state.lock();
            match state.phase {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting => match state.attempt.clone() {
                    Some(outcome) => outcome,
                    None => return Err(ChannelError::Unavailable),
                },
                ConnectionState::Idle | ConnectionState::Closed => {
                    self.inner.begin_connect(&mut state, trigger)
                }
            }
        };
        outcome.await
    }

    /// Send `action` with `payload` and wait for the correlated reply.
    ///
    /// Connects first when needed, without resetting the reconnect budget.
    /// Exactly one frame is written per call; the request itself is never
    /// retried.
    pub async fn request(
        &self,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        if action.trim().is_empty() {
            return Err(ChannelError::InvalidAction);
        }

        if self.state() != ConnectionState::Open {
            tracing::debug!(action, "channel not open, connecting before request");
            if let Err(e) = self.open(Trigger::OnDemand).await {
                tracing::debug!(action, error = %e, "connect before request failed");
            }
        }

        let (id, reply_rx) = {
            let mut state = self.inner.state.lock();
            let outbound = match (&state.phase, &state.link) {
                (ConnectionState::Open, Some(link)) => link.outbound.clone(),
                _ => return Err(ChannelError::Unavailable),
            };

            let id = state.next_id;
            let frame = serde_json::to_string(&RequestEnvelope {
                action,
                payload: &payload,
                correlation_id: id,
            })
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
            state.next_id += 1;

            if outbound.send(frame).is_err() {
                return Err(ChannelError::Closed);
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending.insert(
                id,
                Pending {
                    action: action.to_owned(),
                    created: Instant::now(),
                    reply: reply_tx,
                },
            );
            self.inner.publish(&state);
            (id, reply_rx)
        };
        tracing::debug!(action, correlation_id = id, "request sent");

        // Removes the pending entry however this call ends, including when
        // the caller drops the future.
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };

        let timeout = self.inner.config.response_timeout;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                tracing::warn!(action, correlation_id = id, ?timeout, "response timeout");
                Err(ChannelError::ResponseTimeout {
                    action: action.to_owned(),
                    timeout,
                })
            }
        }
    }

    /// Typed wrapper over [`ChannelClient::request`].
    pub async fn call<P, R>(&self, action: &str, payload: &P) -> Result<R, ChannelError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload =
            serde_json::to_value(payload).map_err(|e| ChannelError::Encode(e.to_string()))?;
        let data = self.request(action, payload).await?;
        serde_json::from_value(data).map_err(|e| ChannelError::Decode(e.to_string()))
    }

    /// Tear the connection down. Pending requests fail with
    /// [`ChannelError::Closed`] and no automatic reconnect follows.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.epoch += 1;
        state.attempt = None;
        state.reconnect_timer = None;
        if let Some(link) = state.link.take() {
            link.shutdown.cancel();
        }
        reject_pending(&mut state);
        if state.phase != ConnectionState::Idle {
            state.phase = ConnectionState::Closed;
            tracing::info!(endpoint = %self.inner.connector.endpoint(), "channel closed");
        }
        self.inner.publish(&state);
    }

    /// Number of requests currently waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

impl Inner {
    /// Start a connection attempt. Caller holds the state lock.
    fn begin_connect(self: &Arc<Self>, state: &mut State, trigger: Trigger) -> ConnectOutcome {
        if trigger == Trigger::Explicit {
            state.reconnect_attempts = 0;
            state.exhausted = false;
        }
        if trigger != Trigger::Reconnect {
            // This attempt takes the place of the scheduled one.
            state.reconnect_timer = None;
        }
        state.epoch += 1;
        let epoch = state.epoch;
        state.phase = ConnectionState::Connecting;

        let (done_tx, done_rx) = oneshot::channel();
        let outcome: ConnectOutcome = async move {
            done_rx.await.unwrap_or(Err(ChannelError::Closed))
        }
        .boxed()
        .shared();
        state.attempt = Some(outcome.clone());

        tracing::info!(
            endpoint = %self.connector.endpoint(),
            attempt = state.reconnect_attempts,
            "connecting"
        );

        let connecting = self.connector.connect();
        let timeout = self.config.connect_timeout;
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Connection(format!(
                    "not open within {timeout:?}"
                ))),
            };
            let outcome = match weak.upgrade() {
                Some(inner) => inner.finish_connect(epoch, result),
                None => Err(ChannelError::Closed),
            };
            let _ = done_tx.send(outcome);
        });

        self.publish(state);
        outcome
    }

    fn finish_connect(
        self: &Arc<Self>,
        epoch: u64,
        result: Result<Transport, ChannelError>,
    ) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            // Superseded by close(); the transport, if any, is dropped here.
            return Err(ChannelError::Closed);
        }
        state.attempt = None;

        match result {
            Ok(transport) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let shutdown = CancellationToken::new();
                state.link = Some(Link {
                    outbound: outbound_tx,
                    shutdown: shutdown.clone(),
                });
                state.phase = ConnectionState::Open;
                state.reconnect_attempts = 0;
                state.exhausted = false;
                tokio::spawn(run_link(
                    Arc::downgrade(self),
                    epoch,
                    transport,
                    outbound_rx,
                    shutdown,
                ));
                tracing::info!(endpoint = %self.connector.endpoint(), "channel connected");
                self.publish(&state);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.connector.endpoint(), error = %e, "connection attempt failed");
                self.connection_lost(&mut state);
                Err(e)
            }
        }
    }

    /// Mark the connection closed and schedule a reconnect if the budget
    /// allows. Caller holds the state lock.
    fn connection_lost(self: &Arc<Self>, state: &mut State) {
        state.phase = ConnectionState::Closed;
        state.attempt = None;
        if let Some(link) = state.link.take() {
            link.shutdown.cancel();
        }
        reject_pending(state);

        let max = self.config.max_reconnect_attempts;
        if state.reconnect_attempts < max {
            state.reconnect_attempts += 1;
            let delay = self.config.reconnect_delay;
            tracing::info!(
                attempt = state.reconnect_attempts,
                max,
                ?delay,
                "scheduling reconnect"
            );
            let weak = Arc::downgrade(self);
            state.reconnect_timer = Some(Timer::schedule(delay, async move {
                if let Some(inner) = weak.upgrade() {
                    inner.reconnect();
                }
            }));
        } else {
            state.exhausted = true;
            tracing::error!(
                endpoint = %self.connector.endpoint(),
                attempts = state.reconnect_attempts,
                "max reconnection attempts reached"
            );
        }
        self.publish(state);
    }

    /// Fired by the reconnect timer.
    fn reconnect(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.phase != ConnectionState::Closed {
            return;
        }
        // The attempt's outcome is logged by finish_connect; callers that
        // arrive meanwhile join it through `state.attempt`.
        let _ = self.begin_connect(&mut state, Trigger::Reconnect);
    }

    /// Route one inbound frame to its waiting caller.
    fn dispatch(&self, text: &str) {
        let envelope = match ResponseEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = ChannelError::MalformedFrame(e.to_string());
                tracing::warn!(error = %err, "dropping inbound frame");
                return;
            }
        };

        let id = envelope.correlation_id;
        let pending = {
            let mut state = self.state.lock();
            let pending = state.pending.remove(&id);
            if pending.is_some() {
                self.publish(&state);
            }
            pending
        };

        match pending {
            Some(pending) => {
                tracing::debug!(
                    action = %pending.action,
                    correlation_id = id,
                    elapsed_ms = pending.created.elapsed().as_millis() as u64,
                    "response received"
                );
                let reply = envelope.into_result().map_err(ChannelError::Remote);
                let _ = pending.reply.send(reply);
            }
            None => {
                tracing::debug!(correlation_id = id, "dropping response with no pending request");
            }
        }
    }

    fn publish(&self, state: &State) {
        self.status_tx.send_replace(ChannelStatus {
            state: state.phase,
            reconnect_attempts: state.reconnect_attempts,
            exhausted: state.exhausted,
            pending: state.pending.len(),
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.state.get_mut().link.take() {
            link.shutdown.cancel();
        }
    }
}

fn reject_pending(state: &mut State) {
    for (id, pending) in state.pending.drain() {
        tracing::debug!(action = %pending.action, correlation_id = id, "rejecting pending request");
        let _ = pending.reply.send(Err(ChannelError::Closed));
    }
}

struct PendingGuard<'a> {
    inner: &'a Arc<Inner>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.pending.remove(&self.id).is_some() {
            self.inner.publish(&state);
        }
    }
}

enum LinkEnd {
    Shutdown,
    RemoteClosed,
    Failed(ChannelError),
}

/// I/O loop for one open connection: writes queued frames, dispatches
/// inbound ones, and reports the loss of the connection.
async fn run_link(
    inner: Weak<Inner>,
    epoch: u64,
    transport: Transport,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    let Transport {
        mut sink,
        mut stream,
    } = transport;

    let end = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                let _ = sink.close().await;
                break LinkEnd::Shutdown;
            }
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(text).await {
                        break LinkEnd::Failed(e);
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break LinkEnd::Shutdown;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(text)) => match inner.upgrade() {
                    Some(inner) => inner.dispatch(&text),
                    None => break LinkEnd::Shutdown,
                },
                Some(Err(e)) => break LinkEnd::Failed(e),
                None => break LinkEnd::RemoteClosed,
            },
        }
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut state = inner.state.lock();
    if state.epoch != epoch || matches!(end, LinkEnd::Shutdown) {
        return;
    }
    match end {
        LinkEnd::RemoteClosed => {
            tracing::warn!(endpoint = %inner.connector.endpoint(), "channel disconnected")
        }
        LinkEnd::Failed(e) => {
            tracing::warn!(endpoint = %inner.connector.endpoint(), error = %e, "channel failed")
        }
        LinkEnd::Shutdown => {}
    }
    inner.connection_lost(&mut state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> (ChannelClient, MemoryListener) {
        let (connector, listener) = MemoryConnector::pair();
        (ChannelClient::new(connector, ChannelConfig::default()), listener)
    }

    async fn open_client() -> (ChannelClient, MemoryListener, MemoryPeer) {
        let (client, mut listener) = client();
        client.connect().await.expect("connect");
        let peer = listener.accept().await.expect("peer");
        (client, listener, peer)
    }

    async fn wait_for_state(client: &ChannelClient, state: ConnectionState) {
        let mut rx = client.subscribe();
        rx.wait_for(|status| status.state == state)
            .await
            .expect("status sender alive");
    }

    /// Spawn a request and return its handle plus the frame the peer saw.
    async fn spawn_request(
        client: &ChannelClient,
        peer: &mut MemoryPeer,
        action: &'static str,
        payload: serde_json::Value,
    ) -> (tokio::task::JoinHandle<Reply>, serde_json::Value) {
        let c = client.clone();
        let handle = tokio::spawn(async move { c.request(action, payload).await });
        let frame = peer.recv_json().await.expect("frame");
        (handle, frame)
    }

    #[tokio::test(start_paused = true)]
    async fn starts_idle() {
        let (client, listener) = client();
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(listener.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_transport() {
        let (client, mut listener) = client();
        let results = futures::future::join_all((0..5).map(|_| client.connect())).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(listener.attempts(), 1);
        assert_eq!(client.state(), ConnectionState::Open);

        client.connect().await.unwrap();
        assert_eq!(listener.attempts(), 1);
        assert!(listener.accept().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn request_resolves_with_matching_reply() {
        let (client, _listener, mut peer) = open_client().await;
        let (handle, frame) =
            spawn_request(&client, &mut peer, "status", json!({"user_id": "123"})).await;

        assert_eq!(frame["action"], "status");
        assert_eq!(frame["payload"], json!({"user_id": "123"}));
        let id = frame["correlationId"].as_u64().unwrap();

        peer.send_json(&json!({
            "correlationId": id,
            "status": "success",
            "data": {"status": "Online"}
        }));
        assert_eq!(handle.await.unwrap(), Ok(json!({"status": "Online"})));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_is_surfaced_verbatim() {
        let (client, _listener, mut peer) = open_client().await;
        let (handle, frame) =
            spawn_request(&client, &mut peer, "login", json!({"user_id": "1"})).await;
        let id = frame["correlationId"].as_u64().unwrap();

        peer.send_json(&json!({"correlationId": id, "status": "error", "error": "not authorized"}));
        assert_eq!(
            handle.await.unwrap(),
            Err(ChannelError::Remote("not authorized".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_replies_reach_their_callers() {
        let (client, _listener, mut peer) = open_client().await;
        let (first, f1) = spawn_request(&client, &mut peer, "status", json!({"n": 1})).await;
        let (second, f2) = spawn_request(&client, &mut peer, "status", json!({"n": 2})).await;

        let id1 = f1["correlationId"].as_u64().unwrap();
        let id2 = f2["correlationId"].as_u64().unwrap();
        assert_ne!(id1, id2);

        peer.send_json(&json!({"correlationId": id2, "status": "success", "data": "two"}));
        peer.send_json(&json!({"correlationId": id1, "status": "success", "data": "one"}));

        assert_eq!(first.await.unwrap(), Ok(json!("one")));
        assert_eq!(second.await.unwrap(), Ok(json!("two")));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_and_malformed_frames_are_dropped() {
        let (client, _listener, mut peer) = open_client().await;
        let (handle, frame) = spawn_request(&client, &mut peer, "status", json!({})).await;
        let id = frame["correlationId"].as_u64().unwrap();

        peer.send("{not json");
        peer.send_json(&json!({"correlationId": id + 100, "status": "success"}));
        peer.send_json(&json!({"correlationId": id, "status": "success", "data": 1}));

        assert_eq!(handle.await.unwrap(), Ok(json!(1)));
        assert_eq!(client.state(), ConnectionState::Open);

        // A duplicate reply for an already resolved id changes nothing.
        peer.send_json(&json!({"correlationId": id, "status": "success", "data": 2}));
        tokio::task::yield_now().await;
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_pending_request() {
        let (client, _listener, mut peer) = open_client().await;
        for _ in 0..3 {
            let (handle, _) = spawn_request(&client, &mut peer, "status", json!({})).await;
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, ChannelError::ResponseTimeout { .. }), "{err:?}");
            assert_eq!(client.pending_requests(), 0);
        }
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_releases_pending_entry() {
        let (client, _listener, mut peer) = open_client().await;
        let (handle, _) = spawn_request(&client, &mut peer, "status", json!({})).await;
        assert_eq!(client.pending_requests(), 1);
        handle.abort();
        let _ = handle.await;
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn correlation_ids_are_unique() {
        let (client, _listener, mut peer) = open_client().await;
        let mut ids = std::collections::HashSet::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let (handle, frame) = spawn_request(&client, &mut peer, "status", json!({})).await;
            assert!(ids.insert(frame["correlationId"].as_u64().unwrap()));
            handles.push(handle);
        }
        assert_eq!(client.pending_requests(), 10);
        client.close();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(ChannelError::Closed));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_connects_lazily() {
        let (client, mut listener) = client();
        let c = client.clone();
        let handle = tokio::spawn(async move { c.request("status", json!({})).await });

        let mut peer = listener.accept().await.unwrap();
        let frame = peer.recv_json().await.unwrap();
        let id = frame["correlationId"].as_u64().unwrap();
        peer.send_json(&json!({"correlationId": id, "status": "success", "data": true}));

        assert_eq!(handle.await.unwrap(), Ok(json!(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn request_fails_unavailable_when_connect_fails() {
        let (client, listener) = client();
        listener.set_mode(AcceptMode::Refuse);
        assert_eq!(
            client.request("status", json!({})).await,
            Err(ChannelError::Unavailable)
        );
        client.close();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_action_is_rejected() {
        let (client, listener) = client();
        assert_eq!(
            client.request("", json!({})).await,
            Err(ChannelError::InvalidAction)
        );
        assert_eq!(listener.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_fails_pending_and_reconnects() {
        let (client, mut listener, mut peer) = open_client().await;
        let (handle, _) = spawn_request(&client, &mut peer, "status", json!({})).await;

        drop(peer);
        assert_eq!(handle.await.unwrap(), Err(ChannelError::Closed));

        wait_for_state(&client, ConnectionState::Closed).await;
        assert_eq!(client.status().reconnect_attempts, 1);

        tokio::time::sleep(DEFAULT_RECONNECT_DELAY + Duration::from_millis(100)).await;
        assert!(listener.accept().await.is_some());
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(client.status().reconnect_attempts, 0);
        assert_eq!(listener.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_budget_is_bounded() {
        let (client, listener) = client();
        listener.set_mode(AcceptMode::Refuse);

        assert!(matches!(
            client.connect().await,
            Err(ChannelError::Connection(_))
        ));

        // Initial attempt plus five automatic reconnects.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(listener.attempts(), 6);
        let status = client.status();
        assert!(status.exhausted);
        assert_eq!(status.state, ConnectionState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(listener.attempts(), 6);

        // An explicit connect starts over with a fresh budget.
        listener.set_mode(AcceptMode::Accept);
        client.connect().await.unwrap();
        assert_eq!(listener.attempts(), 7);
        let status = client.status();
        assert!(!status.exhausted);
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_while_down_spend_the_reconnect_budget() {
        let (client, listener) = client();
        listener.set_mode(AcceptMode::Refuse);
        assert!(client.connect().await.is_err());
        assert_eq!(client.status().reconnect_attempts, 1);

        for expected in 2..=DEFAULT_MAX_RECONNECT_ATTEMPTS {
            assert_eq!(
                client.request("status", json!({})).await,
                Err(ChannelError::Unavailable)
            );
            let status = client.status();
            assert_eq!(status.reconnect_attempts, expected);
            assert!(!status.exhausted);
        }

        assert_eq!(
            client.request("status", json!({})).await,
            Err(ChannelError::Unavailable)
        );
        let status = client.status();
        assert!(status.exhausted);
        assert_eq!(status.reconnect_attempts, DEFAULT_MAX_RECONNECT_ATTEMPTS);
        assert_eq!(listener.attempts(), 6);

        // No reconnect is left scheduled once the budget is spent.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(listener.attempts(), 6);
        assert!(client.status().exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn request_keeps_attempt_count_from_automatic_reconnects() {
        let (client, listener) = client();
        listener.set_mode(AcceptMode::Refuse);
        assert!(client.connect().await.is_err());

        // One automatic reconnect fails.
        tokio::time::sleep(DEFAULT_RECONNECT_DELAY + Duration::from_millis(100)).await;
        assert_eq!(listener.attempts(), 2);
        assert_eq!(client.status().reconnect_attempts, 2);

        assert!(client.request("status", json!({})).await.is_err());
        assert_eq!(listener.attempts(), 3);
        assert_eq!(client.status().reconnect_attempts, 3);

        // A successful open is what resets the count.
        listener.set_mode(AcceptMode::Accept);
        tokio::time::sleep(DEFAULT_RECONNECT_DELAY + Duration::from_millis(100)).await;
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(client.status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_request_is_not_resent() {
        let (client, _listener, mut peer) = open_client().await;
        let (handle, frame) = spawn_request(&client, &mut peer, "status", json!({})).await;
        let id = frame["correlationId"].as_u64().unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(ChannelError::ResponseTimeout { .. })
        ));

        let quiet = tokio::time::timeout(Duration::from_secs(60), peer.recv()).await;
        assert!(quiet.is_err(), "unexpected frame: {quiet:?}");

        let (_next, frame) = spawn_request(&client, &mut peer, "status", json!({})).await;
        assert_eq!(frame["correlationId"].as_u64(), Some(id + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn request_lost_with_connection_is_not_resent() {
        let (client, mut listener, mut peer) = open_client().await;
        let (handle, _) = spawn_request(&client, &mut peer, "status", json!({})).await;
        drop(peer);
        assert_eq!(handle.await.unwrap(), Err(ChannelError::Closed));

        tokio::time::sleep(DEFAULT_RECONNECT_DELAY + Duration::from_millis(100)).await;
        let mut peer = listener.accept().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Open);

        let quiet = tokio::time::timeout(Duration::from_secs(60), peer.recv()).await;
        assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_when_remote_hangs() {
        let (client, listener) = client();
        listener.set_mode(AcceptMode::Hang);
        let started = tokio::time::Instant::now();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Connection(_)));
        assert!(started.elapsed() >= DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(client.state(), ConnectionState::Closed);
        client.close();
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_does_not_reconnect() {
        let (client, listener, mut peer) = open_client().await;
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(peer.recv().await, None);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(listener.attempts(), 1);
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_scheduled_reconnect() {
        let (client, listener, peer) = open_client().await;
        drop(peer);
        wait_for_state(&client, ConnectionState::Closed).await;
        assert_eq!(client.status().reconnect_attempts, 1);

        client.close();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(listener.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_subscription_sees_transitions() {
        let (client, mut listener) = client();
        let mut rx = client.subscribe();
        client.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state, ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn typed_call_decodes_reply() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct StatusData {
            status: String,
        }

        let (client, _listener, mut peer) = open_client().await;
        let c = client.clone();
        let handle = tokio::spawn(async move {
            c.call::<_, StatusData>("status", &json!({"user_id": "1"})).await
        });
        let frame = peer.recv_json().await.unwrap();
        let id = frame["correlationId"].as_u64().unwrap();
        peer.send_json(&json!({"correlationId": id, "status": "success", "data": {"status": "Online"}}));

        assert_eq!(
            handle.await.unwrap(),
            Ok(StatusData {
                status: "Online".into()
            })
        );
    }
}
