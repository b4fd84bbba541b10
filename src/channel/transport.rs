//! Pluggable transports for the channel client.
//!
//! A [`Connector`] opens one duplex connection and hands back a [`Transport`]:
//! a sink of outbound text frames and a stream of inbound ones. The stream
//! ending means the remote side closed the connection.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio_tungstenite::tungstenite::Message;

use super::ChannelError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// One open connection, split into its two halves.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens connections to one fixed endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Transport, ChannelError>>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Connects to a `ws://` or `wss://` URL with tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Transport, ChannelError>> {
        let url = self.url.clone();
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (sink, stream) = ws_stream.split();

            let sink = sink
                .sink_map_err(ChannelError::from)
                .with(|text: String| future::ready(Ok::<_, ChannelError>(Message::text(text))));

            // Control frames are handled by tungstenite itself; only text
            // reaches the client. A close frame ends the stream.
            let stream = stream
                .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
                .filter_map(|msg| {
                    future::ready(match msg {
                        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                        Ok(_) => None,
                        Err(e) => Some(Err(ChannelError::from(e))),
                    })
                });

            Ok::<Transport, ChannelError>(Transport {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
        .boxed()
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// How a [`MemoryConnector`] answers connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptMode {
    /// Hand a new [`MemoryPeer`] to the listener.
    Accept,
    /// Fail immediately, like a refused TCP connection.
    Refuse,
    /// Never complete, like an unresponsive host.
    Hang,
}

/// In-process connector. Every accepted connection shows up on the paired
/// [`MemoryListener`] as a [`MemoryPeer`] playing the service side.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    mode: Arc<Mutex<AcceptMode>>,
    attempts: Arc<AtomicUsize>,
}

/// Service side of a [`MemoryConnector`].
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    mode: Arc<Mutex<AcceptMode>>,
    attempts: Arc<AtomicUsize>,
}

/// One accepted in-process connection, seen from the service side.
pub struct MemoryPeer {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded();
        let mode = Arc::new(Mutex::new(AcceptMode::Accept));
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            MemoryConnector {
                accept_tx,
                mode: mode.clone(),
                attempts: attempts.clone(),
            },
            MemoryListener {
                accept_rx,
                mode,
                attempts,
            },
        )
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Transport, ChannelError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        let accept_tx = self.accept_tx.clone();
        async move {
            match mode {
                AcceptMode::Refuse => {
                    return Err(ChannelError::Connection("connection refused".into()))
                }
                AcceptMode::Hang => future::pending::<()>().await,
                AcceptMode::Accept => {}
            }

            let (client_tx, server_rx) = mpsc::unbounded::<String>();
            let (server_tx, client_rx) = mpsc::unbounded::<String>();
            accept_tx
                .unbounded_send(MemoryPeer {
                    incoming: server_rx,
                    outgoing: server_tx,
                })
                .map_err(|_| ChannelError::Connection("connection refused".into()))?;

            Ok::<Transport, ChannelError>(Transport {
                sink: Box::pin(client_tx.sink_map_err(|_| ChannelError::Closed)),
                stream: Box::pin(client_rx.map(Ok::<String, ChannelError>)),
            })
        }
        .boxed()
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryListener {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.next().await
    }

    pub fn set_mode(&self, mode: AcceptMode) {
        *self.mode.lock() = mode;
    }

    /// Number of connection attempts made through the paired connector.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MemoryPeer {
    /// Next frame written by the client; `None` once it closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.next().await
    }

    /// Next frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Push a frame to the client. Returns false once the client is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.outgoing.unbounded_send(text.into()).is_ok()
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_connector_links_both_sides() {
        let (connector, mut listener) = MemoryConnector::pair();
        let mut transport = connector.connect().await.unwrap();
        let mut peer = listener.accept().await.unwrap();

        transport.sink.send("ping".to_string()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("ping"));

        assert!(peer.send("pong"));
        assert_eq!(transport.stream.next().await, Some(Ok("pong".to_string())));

        drop(peer);
        assert_eq!(transport.stream.next().await, None);
        assert_eq!(listener.attempts(), 1);
    }

    #[tokio::test]
    async fn refused_mode_fails_immediately() {
        let (connector, listener) = MemoryConnector::pair();
        listener.set_mode(AcceptMode::Refuse);
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, ChannelError::Connection(_)));
    }

    #[tokio::test]
    async fn dropped_listener_refuses() {
        let (connector, listener) = MemoryConnector::pair();
        drop(listener);
        assert!(connector.connect().await.is_err());
    }
}
