//! Error types shared by the signaling service and the conference client.

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum Error {
    /// Capture device denied or unavailable. The user can retry.
    #[error("capture device unavailable: {0}")]
    Device(String),

    /// Malformed or unexpected SDP/ICE. Only the named link is affected.
    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: String, reason: String },

    #[error("signaling transport error: {0}")]
    Transport(String),

    #[error("not permitted: {0}")]
    Unauthorized(String),

    #[error("room unavailable: {0}")]
    RoomUnavailable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("nothing to record")]
    NothingToRecord,

    #[error("recording error: {0}")]
    Recording(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn negotiation(peer: impl Into<String>, reason: impl ToString) -> Self {
        Error::Negotiation {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller can sensibly try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Device(_) | Error::RoomUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Device("camera denied".into()).is_retryable());
        assert!(Error::RoomUnavailable("not open yet".into()).is_retryable());
        assert!(!Error::NothingToRecord.is_retryable());
        assert!(!Error::negotiation("m1", "bad sdp").is_retryable());
    }

    #[test]
    fn test_negotiation_message_names_peer() {
        let err = Error::negotiation("abc", "malformed offer");
        assert_eq!(err.to_string(), "negotiation with abc failed: malformed offer");
    }
}
