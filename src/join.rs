//! Room Join Coordinator: `idle -> joining -> joined -> left`.

use crate::connection::{ConferenceEvent, JoinPhase, UiNotifier};
use crate::error::{Error, Result};
use crate::media::MediaTrackController;
use crate::peer::NegotiationRole;
use crate::protocol::{ClientMessage, JoinInfo, MemberId, MemberInfo};
use crate::signaling::SignalingHandle;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Scheduling and permission data for a room, looked up once before joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomAccess {
    pub accepting_joins: bool,
    pub password: Option<String>,
}

impl RoomAccess {
    pub fn open() -> Self {
        Self {
            accepting_joins: true,
            password: None,
        }
    }

    pub fn admit(&self, room_id: &str, password: Option<&str>) -> Result<()> {
        if !self.accepting_joins {
            return Err(Error::RoomUnavailable(format!(
                "room {} is not accepting joins yet",
                room_id
            )));
        }
        match (&self.password, password) {
            (None, _) => Ok(()),
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(Error::Unauthorized(format!("wrong password for room {}", room_id))),
        }
    }
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn lookup(&self, room_id: &str) -> Result<RoomAccess>;
}

/// Every room is open and unprotected.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenDirectory;

#[async_trait]
impl RoomDirectory for OpenDirectory {
    async fn lookup(&self, _room_id: &str) -> Result<RoomAccess> {
        Ok(RoomAccess::open())
    }
}

pub struct RoomJoinCoordinator {
    identity: JoinInfo,
    phase: JoinPhase,
    presence: Vec<MemberInfo>,
    /// Members that were already present when we joined. We offer to these.
    roster: HashSet<MemberId>,
    signaling: SignalingHandle,
    notifier: UiNotifier,
}

impl RoomJoinCoordinator {
    pub fn new(identity: JoinInfo, signaling: SignalingHandle, notifier: UiNotifier) -> Self {
        Self {
            identity,
            phase: JoinPhase::Idle,
            presence: Vec::new(),
            roster: HashSet::new(),
            signaling,
            notifier,
        }
    }

    pub fn identity(&self) -> &JoinInfo {
        &self.identity
    }

    pub fn phase(&self) -> JoinPhase {
        self.phase
    }

    /// Other members currently visible, in arrival order.
    pub fn presence(&self) -> &[MemberInfo] {
        &self.presence
    }

    /// The side we take toward a visible member: offerer if it was in our
    /// roster, answerer if it arrived later. `None` for unknown members and
    /// whenever we only observe.
    pub fn negotiation_role(&self, member: &MemberId) -> Option<NegotiationRole> {
        if self.identity.role.is_observer() || !self.presence.iter().any(|m| &m.member_id == member) {
            return None;
        }
        if self.roster.contains(member) {
            Some(NegotiationRole::Offerer)
        } else {
            Some(NegotiationRole::Answerer)
        }
    }

    /// Checks access, acquires media unless observing, then asks the service to admit us.
    ///
    /// Any failure puts the coordinator back to `Idle` so the caller can try again.
    pub async fn join(
        &mut self,
        directory: &dyn RoomDirectory,
        password: Option<&str>,
        media: &mut MediaTrackController,
    ) -> Result<()> {
        if matches!(self.phase, JoinPhase::Joining | JoinPhase::Joined) {
            return Err(Error::InvalidState(format!("already {}", self.phase)));
        }
        self.set_phase(JoinPhase::Joining);

        match self.request_join(directory, password, media).await {
            Ok(()) => {
                info!(
                    "Joining room {} as {} ({})",
                    self.identity.room_id, self.identity.user_name, self.identity.role
                );
                Ok(())
            }
            Err(e) => {
                warn!("Join of room {} failed: {}", self.identity.room_id, e);
                self.set_phase(JoinPhase::Idle);
                self.notifier.error(&e);
                Err(e)
            }
        }
    }

    async fn request_join(
        &mut self,
        directory: &dyn RoomDirectory,
        password: Option<&str>,
        media: &mut MediaTrackController,
    ) -> Result<()> {
        directory
            .lookup(&self.identity.room_id)
            .await?
            .admit(&self.identity.room_id, password)?;

        if self.identity.role.is_observer() {
            self.signaling.send(ClientMessage::Observe(self.identity.clone()))
        } else {
            media.start_camera().await?;
            self.signaling.send(ClientMessage::Join(self.identity.clone()))
        }
    }

    /// Records the roster and returns whom to offer to. Observers offer to nobody.
    pub fn on_existing_members(&mut self, members: Vec<MemberInfo>) -> Vec<MemberId> {
        if self.phase != JoinPhase::Joining {
            warn!("Roster received while {}, ignoring", self.phase);
            return Vec::new();
        }
        debug!("Roster for {}: {} members", self.identity.room_id, members.len());
        self.presence = members.clone();
        self.roster = members.iter().map(|m| m.member_id.clone()).collect();
        self.set_phase(JoinPhase::Joined);
        self.notifier.emit(ConferenceEvent::Roster(members.clone()));

        if self.identity.role.is_observer() {
            return Vec::new();
        }
        members.into_iter().map(|m| m.member_id).collect()
    }

    /// Presence only. The newcomer offers to us, so nothing is initiated here.
    pub fn on_member_joined(&mut self, member: MemberInfo) {
        if self.phase != JoinPhase::Joined {
            return;
        }
        info!("{} joined {}", member.user_name, self.identity.room_id);
        self.presence.retain(|m| m.member_id != member.member_id);
        self.roster.remove(&member.member_id);
        self.presence.push(member.clone());
        self.notifier.emit(ConferenceEvent::MemberJoined(member));
    }

    /// Returns whether the member was known.
    pub fn on_member_left(&mut self, member_id: &MemberId) -> bool {
        let before = self.presence.len();
        self.presence.retain(|m| &m.member_id != member_id);
        self.roster.remove(member_id);
        let known = self.presence.len() != before;
        if known {
            info!("{} left {}", member_id, self.identity.room_id);
            self.notifier.emit(ConferenceEvent::MemberLeft(member_id.clone()));
        }
        known
    }

    /// Tells the service we are gone. Links and media are released by the caller.
    pub fn leave(&mut self) {
        if matches!(self.phase, JoinPhase::Joining | JoinPhase::Joined) {
            if let Err(e) = self.signaling.send(ClientMessage::Leave) {
                debug!("Leave not delivered: {}", e);
            }
        }
        self.presence.clear();
        self.roster.clear();
        self.set_phase(JoinPhase::Left);
    }

    fn set_phase(&mut self, phase: JoinPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.notifier.phase(phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::SyntheticDevices;
    use crate::protocol::Role;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Locked;

    #[async_trait]
    impl RoomDirectory for Locked {
        async fn lookup(&self, _room_id: &str) -> Result<RoomAccess> {
            Ok(RoomAccess {
                accepting_joins: true,
                password: Some("s3cret".into()),
            })
        }
    }

    struct NotYetOpen;

    #[async_trait]
    impl RoomDirectory for NotYetOpen {
        async fn lookup(&self, _room_id: &str) -> Result<RoomAccess> {
            Ok(RoomAccess {
                accepting_joins: false,
                password: None,
            })
        }
    }

    fn identity(role: Role) -> JoinInfo {
        JoinInfo {
            room_id: "room-7".into(),
            user_id: "u1".into(),
            user_name: "Ana".into(),
            role,
        }
    }

    fn coordinator(role: Role) -> (RoomJoinCoordinator, mpsc::UnboundedReceiver<ClientMessage>) {
        let (signaling, sent) = SignalingHandle::channel();
        let (notifier, _events) = UiNotifier::channel();
        (RoomJoinCoordinator::new(identity(role), signaling, notifier), sent)
    }

    fn member(id: &str, name: &str) -> MemberInfo {
        MemberInfo {
            member_id: id.into(),
            user_name: name.into(),
        }
    }

    #[tokio::test]
    async fn test_participant_join_acquires_media_and_offers_to_roster() {
        let (mut coord, mut sent) = coordinator(Role::Participant);
        let mut media = MediaTrackController::new(Arc::new(SyntheticDevices::new()));
        coord.join(&OpenDirectory, None, &mut media).await.unwrap();
        assert_eq!(coord.phase(), JoinPhase::Joining);
        assert!(media.has_camera());
        assert!(matches!(sent.try_recv().unwrap(), ClientMessage::Join(info) if info.room_id == "room-7"));

        let targets = coord.on_existing_members(vec![member("a", "Bo"), member("b", "Cy")]);
        assert_eq!(targets, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(coord.phase(), JoinPhase::Joined);
    }

    #[tokio::test]
    async fn test_observer_skips_media_and_offers_nobody() {
        let (mut coord, mut sent) = coordinator(Role::Observer);
        let devices = Arc::new(SyntheticDevices::new());
        let mut media = MediaTrackController::new(devices.clone());
        coord.join(&OpenDirectory, None, &mut media).await.unwrap();
        assert!(!media.has_camera());
        assert_eq!(devices.user_media_opened(), 0);
        assert!(matches!(sent.try_recv().unwrap(), ClientMessage::Observe(_)));
        assert!(coord.on_existing_members(vec![member("a", "Bo")]).is_empty());
        assert_eq!(coord.presence().len(), 1);
    }

    #[tokio::test]
    async fn test_denied_camera_is_retryable_and_stays_idle() {
        let (mut coord, mut sent) = coordinator(Role::Participant);
        let devices = Arc::new(SyntheticDevices::new());
        devices.deny_camera(true);
        let mut media = MediaTrackController::new(devices.clone());

        let err = coord.join(&OpenDirectory, None, &mut media).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(coord.phase(), JoinPhase::Idle);
        assert!(sent.try_recv().is_err());

        devices.deny_camera(false);
        coord.join(&OpenDirectory, None, &mut media).await.unwrap();
        assert_eq!(coord.phase(), JoinPhase::Joining);
    }

    #[tokio::test]
    async fn test_directory_gates_the_join() {
        let (mut coord, mut sent) = coordinator(Role::Participant);
        let mut media = MediaTrackController::new(Arc::new(SyntheticDevices::new()));

        let err = coord.join(&NotYetOpen, None, &mut media).await.unwrap_err();
        assert!(matches!(err, Error::RoomUnavailable(_)));
        assert!(err.is_retryable());

        let err = coord.join(&Locked, Some("guess"), &mut media).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert!(sent.try_recv().is_err());

        coord.join(&Locked, Some("s3cret"), &mut media).await.unwrap();
        assert!(sent.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_presence_follows_notifications() {
        let (mut coord, mut sent) = coordinator(Role::Teacher);
        let mut media = MediaTrackController::new(Arc::new(SyntheticDevices::new()));
        coord.join(&OpenDirectory, None, &mut media).await.unwrap();
        coord.on_existing_members(Vec::new());

        coord.on_member_joined(member("b", "Bo"));
        assert_eq!(coord.presence(), &[member("b", "Bo")]);
        assert!(coord.on_member_left(&"b".to_string()));
        assert!(!coord.on_member_left(&"b".to_string()));

        coord.leave();
        assert_eq!(coord.phase(), JoinPhase::Left);
        let last = std::iter::from_fn(|| sent.try_recv().ok()).last();
        assert!(matches!(last, Some(ClientMessage::Leave)));
    }

    #[tokio::test]
    async fn test_negotiation_role_follows_arrival_order() {
        let (mut coord, _sent) = coordinator(Role::Participant);
        let mut media = MediaTrackController::new(Arc::new(SyntheticDevices::new()));
        coord.join(&OpenDirectory, None, &mut media).await.unwrap();
        coord.on_existing_members(vec![member("early", "Bo")]);
        coord.on_member_joined(member("late", "Cy"));

        assert_eq!(coord.negotiation_role(&"early".to_string()), Some(NegotiationRole::Offerer));
        assert_eq!(coord.negotiation_role(&"late".to_string()), Some(NegotiationRole::Answerer));
        assert_eq!(coord.negotiation_role(&"stranger".to_string()), None);

        coord.on_member_left(&"early".to_string());
        assert_eq!(coord.negotiation_role(&"early".to_string()), None);

        let (mut observer, _sent) = coordinator(Role::Observer);
        observer.join(&OpenDirectory, None, &mut media).await.unwrap();
        observer.on_existing_members(vec![member("early", "Bo")]);
        assert_eq!(observer.negotiation_role(&"early".to_string()), None);
    }

    #[tokio::test]
    async fn test_second_join_is_rejected() {
        let (mut coord, _sent) = coordinator(Role::Participant);
        let mut media = MediaTrackController::new(Arc::new(SyntheticDevices::new()));
        coord.join(&OpenDirectory, None, &mut media).await.unwrap();
        assert!(matches!(
            coord.join(&OpenDirectory, None, &mut media).await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(coord.phase(), JoinPhase::Joining);
    }
}
