//! Socket abstraction
//!
//! The client never touches a WebSocket directly. A [`Transport`] opens a
//! [`Socket`]: a pair of channels carrying text frames out and
//! [`SocketEvent`]s in. The far end of those channels ([`SocketPeer`]) is
//! pumped by the WebSocket task in production and driven by a scripted node
//! in tests.

mod ws;

pub use ws::WsTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Capacity of each direction of a socket.
///
/// Writes never wait for space: a full outbound buffer fails the write, so
/// the event loop keeps draining inbound frames while the node is slow.
pub const SOCKET_CHANNEL_CAPACITY: usize = 256;

/// Opens sockets to the node
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Socket, TransportError>;
}

/// Something received from the node side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame
    Text(String),
    /// The socket closed, optionally with a reason
    Closed(Option<String>),
}

/// Something sent towards the node side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame
    Text(String),
    /// Close with a normal-closure code
    Close,
}

/// Client end of an open connection
#[derive(Debug)]
pub struct Socket {
    outbound: mpsc::Sender<Outbound>,
    inbound: mpsc::Receiver<SocketEvent>,
}

impl Socket {
    /// Create a connected socket and its far end
    pub fn pair() -> (Socket, SocketPeer) {
        let (outbound_tx, outbound_rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);

        (
            Socket {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            SocketPeer {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }

    /// Queue a text frame without waiting for buffer space
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .try_send(Outbound::Text(text))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Send("outbound buffer full".into())
                }
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed(None),
            })
    }

    /// Next inbound event; `None` once the far end is gone
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.inbound.recv().await
    }

    /// Ask the far end to close with a normal-closure code.
    ///
    /// With a full buffer the close frame is skipped; dropping the socket
    /// still ends the far end's stream.
    pub fn close(self) {
        let _ = self.outbound.try_send(Outbound::Close);
    }
}

/// Far end of a [`Socket`]
#[derive(Debug)]
pub struct SocketPeer {
    outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<SocketEvent>,
}

impl SocketPeer {
    /// Next frame the client wrote; `None` once the client dropped its socket
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// Deliver a text frame to the client; false if the client is gone
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound
            .send(SocketEvent::Text(text.into()))
            .await
            .is_ok()
    }

    /// Report the socket closed
    pub async fn close(&self, reason: Option<String>) {
        let _ = self.inbound.send(SocketEvent::Closed(reason)).await;
    }
}
