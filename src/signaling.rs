use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, MemberId, PeerSignal, ServerMessage};
use crate::server::SignalingService;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// The conferencing session's one connection to the relay.
///
/// Cloned into the join coordinator, the peer manager and the control relay.
/// Sends never block; if the connection is gone they fail with `Error::Transport`.
#[derive(Clone, Debug)]
pub struct SignalingHandle {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalingHandle {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self { tx }
    }

    /// A handle whose outbound messages land in the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::Transport("signaling connection closed".to_string()))
    }

    pub fn relay(&self, target: &MemberId, signal: &PeerSignal) -> Result<()> {
        self.send(ClientMessage::Relay {
            target_member_id: target.clone(),
            payload: signal.to_payload()?,
        })
    }

    pub fn broadcast(&self, signal: &PeerSignal) -> Result<()> {
        self.send(ClientMessage::Broadcast {
            payload: signal.to_payload()?,
        })
    }
}

pub struct SignalingClient {
    handle: SignalingHandle,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, mut outgoing_rx) = SignalingHandle::channel();

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode signaling message: {}", e),
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Ignoring malformed server message: {}", e),
                }
            }
            debug!("Signaling read loop finished");
        });

        Ok(Self { handle, rx })
    }

    /// Connects, retrying a bounded number of times with a fixed delay.
    pub async fn connect_with_retry(url: &str, attempts: u32, delay: Duration) -> Result<Self> {
        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match Self::connect(url).await {
                Ok(client) => {
                    info!("Connected to signaling service at {}", url);
                    return Ok(client);
                }
                Err(e) => {
                    warn!("Signaling connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        sleep(delay).await;
                    }
                }
            }
        }
        Err(Error::Transport(format!(
            "could not reach {} after {} attempts: {}",
            url,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Wires a client straight into a service running in this process.
    pub async fn in_process(service: Arc<SignalingService>) -> Self {
        let (member_id, rx) = service.connect().await;
        let (handle, mut outgoing_rx) = SignalingHandle::channel();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                service.handle(&member_id, msg).await;
            }
            service.disconnect(&member_id).await;
        });
        Self { handle, rx }
    }

    pub fn handle(&self) -> SignalingHandle {
        self.handle.clone()
    }

    pub async fn receive(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    pub fn into_parts(self) -> (SignalingHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        (self.handle, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JoinInfo, Role};

    #[tokio::test]
    async fn test_handle_reports_closed_connection() {
        let (handle, rx) = SignalingHandle::channel();
        drop(rx);
        let err = handle.send(ClientMessage::Leave).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_in_process_client_joins_and_disconnects() {
        let service = Arc::new(SignalingService::new());
        let mut client = SignalingClient::in_process(service.clone()).await;
        client
            .handle()
            .send(ClientMessage::Join(JoinInfo {
                room_id: "r".into(),
                user_id: "u".into(),
                user_name: "U".into(),
                role: Role::Participant,
            }))
            .unwrap();
        assert_eq!(
            client.receive().await,
            Some(ServerMessage::ExistingMembers { members: vec![] })
        );
        assert_eq!(service.roster("r").await.len(), 1);

        // Dropping every handle closes the bridge, which disconnects the member.
        let (handle, _rx) = client.into_parts();
        drop(handle);
        for _ in 0..100 {
            if service.room_count().await == 0 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(service.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let err = SignalingClient::connect_with_retry("ws://127.0.0.1:1", 2, Duration::from_millis(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Transport(_)));
    }
}
