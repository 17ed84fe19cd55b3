//! Per-connection WebSocket handling

use crate::device::ClientMetadata;
use crate::error::Result;
use crate::protocol::{ServerMessage, INVALID_MESSAGE_FORMAT};
use crate::registry::Outbound;
use crate::relay::SignalingHub;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

/// Time the writer gets to flush queued frames after the reader stops
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

fn header(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Handle a single WebSocket connection until it closes
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    hub: Arc<SignalingHub>,
) -> Result<()> {
    let mut metadata = ClientMetadata::new(None, Some(peer_addr));
    let capture = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        metadata.user_agent = header(request, "user-agent");
        metadata.forwarded_for = header(request, "x-forwarded-for");
        Ok(response)
    };
    let ws_stream = accept_hdr_async(stream, capture).await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(hub.config().outbound_queue_size);
    let conn = hub.connect(metadata, tx);
    let conn_id = conn.id().to_string();

    // Task to forward queued frames to the socket
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let (message, last) = match frame {
                Outbound::Text(text) => (Message::Text(text), false),
                Outbound::Ping(data) => (Message::Ping(data), false),
                Outbound::Close => (Message::Close(None), true),
            };
            if let Err(e) = ws_tx.send(message).await {
                debug!("WebSocket write failed: {}", e);
                break;
            }
            if last {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => hub.handle_text(&conn, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => hub.handle_text(&conn, &text),
                    Err(_) => {
                        hub.metrics().malformed_message();
                        hub.send(&conn, &ServerMessage::error(INVALID_MESSAGE_FORMAT));
                    }
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    conn.mark_alive(Instant::now());
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(connection_id = %conn_id, "WebSocket connection closed by client");
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    error!(connection_id = %conn_id, "WebSocket error: {}", e);
                    break;
                }
            },
            _ = conn.closed() => {
                debug!(connection_id = %conn_id, "Connection closed by relay");
                break;
            }
        }
    }

    hub.disconnect(&conn);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    Ok(())
}
