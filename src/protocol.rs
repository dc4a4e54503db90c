//! Wire messages exchanged over the signaling channel.
//!
//! The service only understands membership messages and the opaque
//! `relay`/`broadcast` envelopes. Everything clients say to each other
//! travels as a [`PeerSignal`] encoded into the envelope payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Connection identifier assigned by the signaling service.
pub type MemberId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Participant,
    Teacher,
    Admin,
    Observer,
}

impl Role {
    pub fn is_moderator(self) -> bool {
        matches!(self, Role::Teacher | Role::Admin)
    }

    pub fn is_observer(self) -> bool {
        self == Role::Observer
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Participant => write!(f, "participant"),
            Role::Teacher => write!(f, "teacher"),
            Role::Admin => write!(f, "admin"),
            Role::Observer => write!(f, "observer"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "participant" | "student" => Ok(Role::Participant),
            "teacher" => Ok(Role::Teacher),
            "admin" => Ok(Role::Admin),
            "observer" => Ok(Role::Observer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// What a client tells the service about itself when joining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinInfo {
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
}

/// Roster entry as seen by other room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub member_id: MemberId,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join(JoinInfo),
    Observe(JoinInfo),
    #[serde(rename_all = "camelCase")]
    Relay {
        target_member_id: MemberId,
        payload: Value,
    },
    Broadcast {
        payload: Value,
    },
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    ExistingMembers {
        members: Vec<MemberInfo>,
    },
    MemberJoined(MemberInfo),
    #[serde(rename_all = "camelCase")]
    MemberLeft {
        member_id: MemberId,
    },
    #[serde(rename_all = "camelCase")]
    Relayed {
        from_member_id: MemberId,
        payload: Value,
    },
    Error {
        message: String,
    },
}

/// A network path candidate in the browser's JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Client-to-client payloads carried inside relay/broadcast envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerSignal {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    MuteOne {
        mute: bool,
    },
    MuteAll {
        mute: bool,
    },
    #[serde(rename_all = "camelCase")]
    Chat {
        user_name: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    HandRaise {
        user_id: String,
        user_name: String,
    },
}

impl PeerSignal {
    pub fn to_payload(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_payload(payload: &Value) -> serde_json::Result<Self> {
        serde_json::from_value(payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let msg = ClientMessage::Join(JoinInfo {
            room_id: "r1".into(),
            user_id: "u1".into(),
            user_name: "Ana".into(),
            role: Role::Teacher,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "join", "roomId": "r1", "userId": "u1", "userName": "Ana", "role": "teacher"})
        );
    }

    #[test]
    fn test_relay_envelope_is_opaque() {
        let text = r#"{"type":"relay","targetMemberId":"m2","payload":{"anything":[1,2,3]}}"#;
        match serde_json::from_str::<ClientMessage>(text).unwrap() {
            ClientMessage::Relay { target_member_id, payload } => {
                assert_eq!(target_member_id, "m2");
                assert_eq!(payload, json!({"anything": [1, 2, 3]}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ice_candidate_uses_browser_field_names() {
        let signal = PeerSignal::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        let value = signal.to_payload().unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(value["candidate"]["sdpMid"], "0");
    }

    #[test]
    fn test_server_message_tags() {
        let left = ServerMessage::MemberLeft { member_id: "m9".into() };
        assert_eq!(
            serde_json::to_value(&left).unwrap(),
            json!({"type": "member-left", "memberId": "m9"})
        );
        let joined = ServerMessage::MemberJoined(MemberInfo {
            member_id: "m1".into(),
            user_name: "Bo".into(),
        });
        assert_eq!(
            serde_json::to_value(&joined).unwrap(),
            json!({"type": "member-joined", "memberId": "m1", "userName": "Bo"})
        );
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Teacher".parse::<Role>().unwrap(), Role::Teacher);
        assert!("janitor".parse::<Role>().is_err());
        assert!(Role::Admin.is_moderator());
        assert!(!Role::Participant.is_moderator());
    }
}
