use super::service::SignalingService;
use crate::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Accepts WebSocket connections until the listener fails.
pub async fn serve(listener: TcpListener, service: Arc<SignalingService>) -> Result<()> {
    info!("Signaling service listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            handle_connection(stream, addr, service).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, service: Arc<SignalingService>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();
    let (member_id, mut outbound) = service.connect().await;
    info!("Client {} connected from {}", member_id, addr);

    // Outgoing messages
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let json = match serde_json::to_string::<ServerMessage>(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode outbound message: {}", e);
                    continue;
                }
            };
            if write.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Incoming messages
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => service.handle(&member_id, msg).await,
                Err(e) => debug!("Ignoring malformed message from {}: {}", member_id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} read error: {}", member_id, e);
                break;
            }
        }
    }

    service.disconnect(&member_id).await;
    send_task.abort();
    info!("Client {} disconnected", member_id);
}
