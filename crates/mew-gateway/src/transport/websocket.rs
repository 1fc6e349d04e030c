//! WebSocket transport adapter
//!
//! Listens on the configured address and turns every connection into one
//! gateway channel: text frames in (envelope JSON or `#stream#` data),
//! text frames out, with a writer task draining the channel's bounded
//! outbound queue. The path portion of the URL is ignored; the first frame
//! on each connection must be a join envelope, which is the core's
//! business, not the transport's.

use crate::space::channel::{EventSender, GatewayEvent, Outbound, channel_pair};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use mew_core::config::ListenAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bind the listener. Separate from [`run_listener`] so a port collision
/// surfaces as a startup failure instead of a background log line.
pub async fn bind(listen: &ListenAddr) -> Result<TcpListener> {
    TcpListener::bind((listen.host.as_str(), listen.port))
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {listen}"))
}

/// Accept connections until cancellation. Each connection gets its own
/// channel and task; a failing connection never affects the listener.
pub async fn run_listener(listener: TcpListener, events: EventSender, cancel: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("WebSocket listener on ws://{addr}"),
        Err(_) => info!("WebSocket listener started"),
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("WebSocket listener cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("New WebSocket connection from {addr}");
                        let events = events.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, events, cancel).await;
                        });
                    }
                    Err(err) => {
                        error!("WebSocket accept error: {err}");
                        // Brief pause before retrying to avoid a tight error loop
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    info!("WebSocket listener stopped");
}

async fn handle_connection(stream: TcpStream, events: EventSender, cancel: CancellationToken) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!("WebSocket handshake failed: {err}");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let (handle, mut outbound) = channel_pair();
    let channel_id = handle.id();
    if events
        .send(GatewayEvent::Connected { handle })
        .await
        .is_err()
    {
        return;
    }

    // Writer: drains the outbound queue until the core drops the channel
    // handle or asks for a close.
    tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    if sink.send(Message::text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if events
                            .send(GatewayEvent::Frame { channel_id, text: text.to_string() })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        // Stream chunks may arrive as binary frames; they are
                        // still text on the inside.
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                if events
                                    .send(GatewayEvent::Frame { channel_id, text })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(_) => {
                                let _ = events
                                    .send(GatewayEvent::Malformed {
                                        channel_id,
                                        reason: "binary frame is not valid UTF-8".to_string(),
                                    })
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong are handled by tungstenite
                    Some(Err(err)) => {
                        debug!("WebSocket read error on {channel_id}: {err}");
                        break;
                    }
                }
            }
        }
    }

    let _ = events
        .send(GatewayEvent::Disconnected { channel_id })
        .await;
    debug!("WebSocket connection {channel_id} closed");
}
