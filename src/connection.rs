use crate::media::TrackKind;
use crate::protocol::{MemberId, MemberInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Lifecycle of one PeerLink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// States after which the link is torn down; there is no reconnection.
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed | LinkState::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::New => write!(f, "New"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Failed => write!(f, "Failed"),
            LinkState::Closed => write!(f, "Closed"),
        }
    }
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinPhase {
    Idle,
    Joining,
    Joined,
    Left,
}

impl fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinPhase::Idle => write!(f, "Idle"),
            JoinPhase::Joining => write!(f, "Joining"),
            JoinPhase::Joined => write!(f, "Joined"),
            JoinPhase::Left => write!(f, "Left"),
        }
    }
}

/// Snapshot of the conference as the UI sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConferenceStatus {
    pub phase: JoinPhase,
    pub links: BTreeMap<MemberId, LinkState>,
    pub last_error: Option<String>,
}

impl Default for ConferenceStatus {
    fn default() -> Self {
        Self {
            phase: JoinPhase::Idle,
            links: BTreeMap::new(),
            last_error: None,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConferenceStatus>>,
    receiver: watch::Receiver<ConferenceStatus>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ConferenceStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_phase(&self, phase: JoinPhase) {
        self.status.send_modify(|status| {
            status.phase = phase;
            if phase == JoinPhase::Left {
                status.links.clear();
            }
        });
    }

    pub fn update_link(&self, member: &MemberId, state: LinkState) {
        self.status.send_modify(|status| {
            if state.is_terminal() {
                status.links.remove(member);
            } else {
                status.links.insert(member.clone(), state);
            }
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    pub fn snapshot(&self) -> ConferenceStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConferenceStatus> {
        self.receiver.clone()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the UI layer is told about, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ConferenceEvent {
    PhaseChanged(JoinPhase),
    Roster(Vec<MemberInfo>),
    MemberJoined(MemberInfo),
    MemberLeft(MemberId),
    LinkState {
        member: MemberId,
        state: LinkState,
    },
    LinkClosed {
        member: MemberId,
        reason: String,
    },
    RemoteTrack {
        member: MemberId,
        kind: TrackKind,
        track_id: String,
    },
    ScreenShare {
        active: bool,
    },
    Chat {
        from: MemberId,
        user_name: String,
        message: String,
    },
    HandRaised {
        from: MemberId,
        user_id: String,
        user_name: String,
    },
    MuteRequested {
        from: MemberId,
        mute: bool,
        all: bool,
    },
    RecordingSaved(PathBuf),
    Error {
        message: String,
        retryable: bool,
    },
}

/// Fans UI-facing updates out to the status board and the event stream.
#[derive(Clone)]
pub struct UiNotifier {
    monitor: ConnectionMonitor,
    events: mpsc::UnboundedSender<ConferenceEvent>,
}

impl UiNotifier {
    pub fn new(monitor: ConnectionMonitor, events: mpsc::UnboundedSender<ConferenceEvent>) -> Self {
        Self { monitor, events }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConferenceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(ConnectionMonitor::new(), tx), rx)
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn emit(&self, event: ConferenceEvent) {
        // Nobody listening is fine; the status board still updates.
        let _ = self.events.send(event);
    }

    pub fn phase(&self, phase: JoinPhase) {
        self.monitor.update_phase(phase);
        self.emit(ConferenceEvent::PhaseChanged(phase));
    }

    pub fn link_state(&self, member: &MemberId, state: LinkState) {
        self.monitor.update_link(member, state);
        self.emit(ConferenceEvent::LinkState {
            member: member.clone(),
            state,
        });
    }

    pub fn link_closed(&self, member: &MemberId, reason: String) {
        self.monitor.update_link(member, LinkState::Closed);
        self.emit(ConferenceEvent::LinkClosed {
            member: member.clone(),
            reason,
        });
    }

    pub fn error(&self, error: &crate::error::Error) {
        self.monitor.set_error(error.to_string());
        self.emit(ConferenceEvent::Error {
            message: error.to_string(),
            retryable: error.is_retryable(),
        });
    }
}
