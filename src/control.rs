//! Control-Plane Relay: hand-raise, chat and mute requests.
//!
//! Moderation is cooperative. The role check happens here on the sending
//! side only, and a muted client can turn its microphone back on.

use crate::error::{Error, Result};
use crate::protocol::{JoinInfo, MemberId, PeerSignal};
use crate::signaling::SignalingHandle;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct HandRaise {
    pub from: MemberId,
    pub user_id: String,
    pub user_name: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Chat {
        from: MemberId,
        user_name: String,
        message: String,
    },
    HandRaised(HandRaise),
    Mute {
        from: MemberId,
        mute: bool,
        all: bool,
    },
}

pub struct ControlPlaneRelay {
    identity: JoinInfo,
    signaling: SignalingHandle,
    latest_hand: Option<HandRaise>,
}

impl ControlPlaneRelay {
    pub fn new(identity: JoinInfo, signaling: SignalingHandle) -> Self {
        Self {
            identity,
            signaling,
            latest_hand: None,
        }
    }

    pub fn raise_hand(&self) -> Result<()> {
        info!("{} raised a hand", self.identity.user_name);
        self.signaling.broadcast(&PeerSignal::HandRaise {
            user_id: self.identity.user_id.clone(),
            user_name: self.identity.user_name.clone(),
        })
    }

    /// Broadcasts trimmed chat text and returns what was sent.
    pub fn send_chat(&self, text: &str) -> Result<String> {
        let message = text.trim();
        if message.is_empty() {
            return Err(Error::InvalidState("chat message is empty".to_string()));
        }
        self.signaling.broadcast(&PeerSignal::Chat {
            user_name: self.identity.user_name.clone(),
            message: message.to_string(),
        })?;
        Ok(message.to_string())
    }

    pub fn mute_all(&self, mute: bool) -> Result<()> {
        self.require_moderator("mute-all")?;
        info!("Requesting mute={} from the whole room", mute);
        self.signaling.broadcast(&PeerSignal::MuteAll { mute })
    }

    pub fn mute_one(&self, target: &MemberId, mute: bool) -> Result<()> {
        self.require_moderator("mute-one")?;
        info!("Requesting mute={} from {}", mute, target);
        self.signaling.relay(target, &PeerSignal::MuteOne { mute })
    }

    /// Interprets an inbound control signal. Media signals yield `None`.
    pub fn on_signal(&mut self, from: &MemberId, signal: PeerSignal) -> Option<ControlEvent> {
        match signal {
            PeerSignal::Chat { user_name, message } => Some(ControlEvent::Chat {
                from: from.clone(),
                user_name,
                message,
            }),
            PeerSignal::HandRaise { user_id, user_name } => {
                let raise = HandRaise {
                    from: from.clone(),
                    user_id,
                    user_name,
                    raised_at: Utc::now(),
                };
                self.latest_hand = Some(raise.clone());
                Some(ControlEvent::HandRaised(raise))
            }
            PeerSignal::MuteAll { mute } => Some(ControlEvent::Mute {
                from: from.clone(),
                mute,
                all: true,
            }),
            PeerSignal::MuteOne { mute } => Some(ControlEvent::Mute {
                from: from.clone(),
                mute,
                all: false,
            }),
            other => {
                debug!("Not a control signal: {:?}", other);
                None
            }
        }
    }

    /// The most recent hand raised in the room, for moderators.
    pub fn latest_hand(&self) -> Option<&HandRaise> {
        self.latest_hand.as_ref()
    }

    fn require_moderator(&self, action: &str) -> Result<()> {
        if self.identity.role.is_moderator() {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "{} requires a teacher or admin, not {}",
                action, self.identity.role
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessage, Role};
    use tokio::sync::mpsc;

    fn relay(role: Role) -> (ControlPlaneRelay, mpsc::UnboundedReceiver<ClientMessage>) {
        let (signaling, sent) = SignalingHandle::channel();
        let identity = JoinInfo {
            room_id: "r".into(),
            user_id: "u9".into(),
            user_name: "Dee".into(),
            role,
        };
        (ControlPlaneRelay::new(identity, signaling), sent)
    }

    fn broadcast_signal(msg: ClientMessage) -> PeerSignal {
        match msg {
            ClientMessage::Broadcast { payload } => PeerSignal::from_payload(&payload).unwrap(),
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[test]
    fn test_chat_is_trimmed_and_blank_rejected() {
        let (relay, mut sent) = relay(Role::Participant);
        assert_eq!(relay.send_chat("  hello  ").unwrap(), "hello");
        assert_eq!(
            broadcast_signal(sent.try_recv().unwrap()),
            PeerSignal::Chat {
                user_name: "Dee".into(),
                message: "hello".into()
            }
        );
        assert!(relay.send_chat("   \n").is_err());
        assert!(sent.try_recv().is_err());
    }

    #[test]
    fn test_only_moderators_mute() {
        let (student, mut sent) = relay(Role::Participant);
        assert!(matches!(student.mute_all(true), Err(Error::Unauthorized(_))));
        assert!(matches!(student.mute_one(&"m2".to_string(), true), Err(Error::Unauthorized(_))));
        assert!(sent.try_recv().is_err());

        let (teacher, mut sent) = relay(Role::Teacher);
        teacher.mute_all(true).unwrap();
        assert_eq!(broadcast_signal(sent.try_recv().unwrap()), PeerSignal::MuteAll { mute: true });
        teacher.mute_one(&"m2".to_string(), false).unwrap();
        assert!(matches!(
            sent.try_recv().unwrap(),
            ClientMessage::Relay { target_member_id, .. } if target_member_id == "m2"
        ));
    }

    #[test]
    fn test_inbound_signals_and_latest_hand() {
        let (mut relay, _sent) = relay(Role::Admin);
        let from = "m3".to_string();
        assert!(relay.on_signal(&from, PeerSignal::Offer { sdp: "x".into() }).is_none());
        assert!(matches!(
            relay.on_signal(&from, PeerSignal::MuteOne { mute: true }),
            Some(ControlEvent::Mute { all: false, mute: true, .. })
        ));

        relay.on_signal(
            &from,
            PeerSignal::HandRaise {
                user_id: "u3".into(),
                user_name: "Eli".into(),
            },
        );
        relay.on_signal(
            &"m4".to_string(),
            PeerSignal::HandRaise {
                user_id: "u4".into(),
                user_name: "Fay".into(),
            },
        );
        assert_eq!(relay.latest_hand().unwrap().user_name, "Fay");
    }
}
