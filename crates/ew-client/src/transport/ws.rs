//! WebSocket transport over `tokio-tungstenite`

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Outbound, Socket, SocketPeer, Transport};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` connections
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Socket, TransportError> {
        tracing::debug!("Opening WebSocket to {}", url);
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;

        let (socket, peer) = Socket::pair();
        tokio::spawn(pump(ws, peer));
        Ok(socket)
    }
}

/// Move frames between the WebSocket and the socket channels until either
/// side closes
async fn pump(ws: WsStream, mut peer: SocketPeer) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            outbound = peer.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        tracing::warn!("WebSocket write failed: {}", e);
                        peer.close(Some(e.to_string())).await;
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client closing".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    let _ = ws_tx.close().await;
                    break;
                }
            },

            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    // The event loop never waits on its own writes and keeps reading
                    if !peer.send_text(text.as_str()).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()));
                    tracing::debug!("WebSocket closed by node: {:?}", reason);
                    peer.close(reason).await;
                    break;
                }
                // Pings are answered by tungstenite; binary frames are not part of the protocol
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!("WebSocket read failed: {}", e);
                    peer.close(Some(e.to_string())).await;
                    break;
                }
                None => {
                    peer.close(None).await;
                    break;
                }
            },
        }
    }

    tracing::debug!("WebSocket pump finished");
}
