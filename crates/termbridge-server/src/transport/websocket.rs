//! WebSocket listener using tokio-tungstenite.
//!
//! Every protocol event travels as one text frame. Binary frames carry
//! nothing and are skipped.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use termbridge_core::{BridgeError, BridgeResult, MAX_FRAME_SIZE};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind `bind_addr` and complete WebSocket handshakes in the background.
///
/// Returns the bound address (useful with port 0) and a receiver that
/// yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> BridgeResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| BridgeError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| BridgeError::Transport(format!("WS local address: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("no consumer for accepted connections, listener exiting");
                break;
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send one text frame.
pub async fn ws_send_text<S>(ws: &mut WebSocketStream<S>, text: String) -> BridgeResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| BridgeError::Transport(format!("WS send failed: {e}")))
}

/// Start the closing handshake. Failures are irrelevant at this point.
pub async fn ws_close<S>(ws: &mut WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if let Err(e) = ws.send(Message::Close(None)).await {
        debug!(error = %e, "WS close failed");
    }
}

/// Receive the next text frame.
///
/// Returns `None` once the peer closed. Frames larger than
/// [`MAX_FRAME_SIZE`] are an error, which ends the connection.
pub async fn ws_recv_text<S>(ws: &mut WebSocketStream<S>) -> BridgeResult<Option<String>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_SIZE {
                    return Err(BridgeError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                        text.len()
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(len = data.len(), "ignoring binary frame");
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(BridgeError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
