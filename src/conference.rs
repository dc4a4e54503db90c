//! The client-side dispatch loop.
//!
//! Server messages, transport events, UI commands and timer ticks are all
//! handled one at a time by a single task that owns every component, so no
//! client state is shared or locked.

use crate::config::ClientConfig;
use crate::connection::{ConferenceEvent, ConferenceStatus, UiNotifier};
use crate::control::{ControlEvent, ControlPlaneRelay};
use crate::devices::MediaDevices;
use crate::error::{Error, Result};
use crate::join::{OpenDirectory, RoomDirectory, RoomJoinCoordinator};
use crate::media::MediaTrackController;
use crate::peer::{NegotiationRole, PeerConnectionManager};
use crate::protocol::{JoinInfo, MemberId, PeerSignal, ServerMessage};
use crate::recorder::LocalRecorder;
use crate::signaling::SignalingHandle;
use crate::transport::{LinkEvent, TransportFactory};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConferenceOptions {
    pub identity: JoinInfo,
    pub room_password: Option<String>,
    pub negotiation_timeout: Duration,
    pub recordings_dir: PathBuf,
}

impl From<&ClientConfig> for ConferenceOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            room_password: config.room_password.clone(),
            negotiation_timeout: config.negotiation_timeout,
            recordings_dir: config.recordings_dir.clone(),
        }
    }
}

/// UI actions accepted by [`Conference::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConferenceCommand {
    ToggleAudio,
    ToggleVideo,
    StartScreenShare,
    StopScreenShare,
    ToggleScreenShare,
    SendChat(String),
    RaiseHand,
    MuteAll(bool),
    MuteOne { member: MemberId, mute: bool },
    /// Rebuilds the link to a member after it failed or timed out.
    RetryLink(MemberId),
    StartRecording,
    StopRecording,
    ToggleRecording,
    Leave,
}

pub struct Conference {
    options: ConferenceOptions,
    coordinator: RoomJoinCoordinator,
    peers: PeerConnectionManager,
    media: MediaTrackController,
    control: ControlPlaneRelay,
    recorder: LocalRecorder,
    directory: Arc<dyn RoomDirectory>,
    notifier: UiNotifier,
    transport_rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Conference {
    pub fn new(
        options: ConferenceOptions,
        signaling: SignalingHandle,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> (Self, mpsc::UnboundedReceiver<ConferenceEvent>) {
        let (notifier, events) = UiNotifier::channel();
        let (peers, transport_rx) = PeerConnectionManager::new(
            options.identity.role,
            factory,
            signaling.clone(),
            notifier.clone(),
            options.negotiation_timeout,
        );
        let conference = Self {
            coordinator: RoomJoinCoordinator::new(
                options.identity.clone(),
                signaling.clone(),
                notifier.clone(),
            ),
            peers,
            media: MediaTrackController::new(devices),
            control: ControlPlaneRelay::new(options.identity.clone(), signaling),
            recorder: LocalRecorder::new(options.recordings_dir.clone()),
            directory: Arc::new(OpenDirectory),
            notifier,
            transport_rx,
            options,
        };
        (conference, events)
    }

    pub fn with_directory(mut self, directory: Arc<dyn RoomDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn status(&self) -> watch::Receiver<ConferenceStatus> {
        self.notifier.monitor().subscribe()
    }

    pub fn coordinator(&self) -> &RoomJoinCoordinator {
        &self.coordinator
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    pub fn media(&self) -> &MediaTrackController {
        &self.media
    }

    pub fn control(&self) -> &ControlPlaneRelay {
        &self.control
    }

    pub fn recorder(&self) -> &LocalRecorder {
        &self.recorder
    }

    fn is_observer(&self) -> bool {
        self.options.identity.role.is_observer()
    }

    pub async fn join(&mut self) -> Result<()> {
        let password = self.options.room_password.clone();
        self.coordinator
            .join(self.directory.as_ref(), password.as_deref(), &mut self.media)
            .await
    }

    /// Releases every link and every capture device, even mid-negotiation.
    /// A running or unsaved recording is saved first.
    pub async fn leave(&mut self) {
        if self.recorder.has_pending_artifact() {
            if let Err(e) = self.stop_recording().await {
                warn!("Recording could not be saved on leave: {}", e);
            }
        }
        self.peers.close_all().await;
        self.media.release();
        self.coordinator.leave();
        info!("Left room {}", self.options.identity.room_id);
    }

    pub fn toggle_audio(&mut self) -> Result<bool> {
        self.media.toggle_audio()
    }

    pub fn toggle_video(&mut self) -> Result<bool> {
        self.media.toggle_video()
    }

    pub async fn start_screen_share(&mut self) -> Result<()> {
        if self.is_observer() {
            return Err(Error::InvalidState("observers do not share media".to_string()));
        }
        if self.media.is_screen_sharing() {
            return Ok(());
        }
        self.media.start_screen_share(&mut self.peers).await?;
        self.notifier.emit(ConferenceEvent::ScreenShare { active: true });
        if self.recorder.is_recording() {
            for track in self.media.recordable_tracks() {
                if let Err(e) = self.recorder.add_track(track) {
                    warn!("Screen capture not added to the recording: {}", e);
                    self.notifier.error(&e);
                }
            }
        }
        Ok(())
    }

    pub async fn stop_screen_share(&mut self) -> Result<()> {
        if !self.media.is_screen_sharing() {
            return Ok(());
        }
        self.media.stop_screen_share(&mut self.peers).await?;
        self.notifier.emit(ConferenceEvent::ScreenShare { active: false });
        Ok(())
    }

    pub fn send_chat(&mut self, text: &str) -> Result<String> {
        self.control.send_chat(text)
    }

    pub fn raise_hand(&mut self) -> Result<()> {
        self.control.raise_hand()
    }

    pub fn mute_all(&mut self, mute: bool) -> Result<()> {
        self.control.mute_all(mute)
    }

    pub fn mute_one(&mut self, member: &MemberId, mute: bool) -> Result<()> {
        self.control.mute_one(member, mute)
    }

    /// Rebuilds the link to `member` with the role the arrival order gives us.
    /// If the member joined after us we drop our side and wait for its offer.
    pub async fn retry_link(&mut self, member: &MemberId) -> Result<()> {
        let role = self.coordinator.negotiation_role(member).ok_or_else(|| {
            Error::InvalidState(format!("no link can be negotiated with {}", member))
        })?;
        info!("Retrying link to {} as {:?}", member, role);
        let outbound = self.media.outbound();
        self.peers.retry_link(member, role, &outbound).await
    }

    pub fn start_recording(&mut self) -> Result<()> {
        self.recorder.start(self.media.recordable_tracks())
    }

    pub async fn stop_recording(&mut self) -> Result<PathBuf> {
        let path = self.recorder.stop().await?;
        self.notifier.emit(ConferenceEvent::RecordingSaved(path.clone()));
        Ok(path)
    }

    pub async fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::ExistingMembers { members } => {
                let targets = self.coordinator.on_existing_members(members);
                for remote in targets {
                    let outbound = self.media.outbound();
                    if let Err(e) = self
                        .peers
                        .create_link(&remote, NegotiationRole::Offerer, &outbound)
                        .await
                    {
                        self.notifier.error(&e);
                    }
                }
            }
            ServerMessage::MemberJoined(member) => self.coordinator.on_member_joined(member),
            ServerMessage::MemberLeft { member_id } => {
                self.coordinator.on_member_left(&member_id);
                self.peers.on_member_left(&member_id).await;
            }
            ServerMessage::Relayed {
                from_member_id,
                payload,
            } => match PeerSignal::from_payload(&payload) {
                Ok(signal) => self.on_peer_signal(&from_member_id, signal).await,
                Err(e) => warn!("Unreadable payload from {}: {}", from_member_id, e),
            },
            ServerMessage::Error { message } => {
                warn!("Signaling service rejected a message: {}", message);
                self.notifier.error(&Error::InvalidState(message));
            }
        }
    }

    async fn on_peer_signal(&mut self, from: &MemberId, signal: PeerSignal) {
        let outcome = match signal {
            PeerSignal::Offer { sdp } => {
                let outbound = self.media.outbound();
                self.peers.on_offer(from, sdp, &outbound).await
            }
            PeerSignal::Answer { sdp } => self.peers.on_answer(from, sdp).await,
            PeerSignal::IceCandidate { candidate } => self.peers.on_ice_candidate(from, candidate).await,
            other => {
                if let Some(event) = self.control.on_signal(from, other) {
                    self.apply_control(event);
                }
                Ok(())
            }
        };
        if let Err(e) = outcome {
            self.notifier.error(&e);
        }
    }

    fn apply_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Chat {
                from,
                user_name,
                message,
            } => self.notifier.emit(ConferenceEvent::Chat {
                from,
                user_name,
                message,
            }),
            ControlEvent::HandRaised(raise) => self.notifier.emit(ConferenceEvent::HandRaised {
                from: raise.from,
                user_id: raise.user_id,
                user_name: raise.user_name,
            }),
            ControlEvent::Mute { from, mute, all } => {
                // Cooperative: the local user can switch the microphone back on.
                if !self.is_observer() && self.media.set_audio_enabled(!mute) {
                    info!("Microphone {} at the request of {}", if mute { "muted" } else { "unmuted" }, from);
                }
                self.notifier.emit(ConferenceEvent::MuteRequested { from, mute, all });
            }
        }
    }

    pub async fn handle_transport_event(&mut self, event: LinkEvent) {
        self.peers.on_transport_event(event).await;
    }

    pub async fn tick(&mut self, now: Instant) {
        self.peers.expire_stale(now).await;
    }

    /// The relay is gone: nobody stays visible, local media keeps working.
    pub async fn signaling_lost(&mut self) {
        error!("Lost the signaling service");
        self.peers.close_all().await;
        self.coordinator.leave();
        self.notifier
            .error(&Error::Transport("signaling service unreachable".to_string()));
    }

    pub async fn execute(&mut self, command: ConferenceCommand) -> Result<()> {
        debug!("Command {:?}", command);
        match command {
            ConferenceCommand::ToggleAudio => self.toggle_audio().map(|_| ()),
            ConferenceCommand::ToggleVideo => self.toggle_video().map(|_| ()),
            ConferenceCommand::StartScreenShare => self.start_screen_share().await,
            ConferenceCommand::StopScreenShare => self.stop_screen_share().await,
            ConferenceCommand::ToggleScreenShare => {
                if self.media.is_screen_sharing() {
                    self.stop_screen_share().await
                } else {
                    self.start_screen_share().await
                }
            }
            ConferenceCommand::SendChat(text) => self.send_chat(&text).map(|_| ()),
            ConferenceCommand::RaiseHand => self.raise_hand(),
            ConferenceCommand::MuteAll(mute) => self.mute_all(mute),
            ConferenceCommand::MuteOne { member, mute } => self.mute_one(&member, mute),
            ConferenceCommand::RetryLink(member) => self.retry_link(&member).await,
            ConferenceCommand::StartRecording => self.start_recording(),
            ConferenceCommand::StopRecording => self.stop_recording().await.map(|_| ()),
            ConferenceCommand::ToggleRecording => {
                if self.recorder.has_pending_artifact() {
                    self.stop_recording().await.map(|_| ())
                } else {
                    self.start_recording()
                }
            }
            ConferenceCommand::Leave => {
                self.leave().await;
                Ok(())
            }
        }
    }

    /// Drives the conference until `Leave` is received or the command channel closes.
    pub async fn run(
        mut self,
        mut server_rx: mpsc::UnboundedReceiver<ServerMessage>,
        mut commands: mpsc::UnboundedReceiver<ConferenceCommand>,
    ) {
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut server_up = true;

        loop {
            tokio::select! {
                msg = server_rx.recv(), if server_up => match msg {
                    Some(msg) => self.handle_server_message(msg).await,
                    None => {
                        server_up = false;
                        self.signaling_lost().await;
                    }
                },
                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event).await,
                command = commands.recv() => match command {
                    Some(ConferenceCommand::Leave) | None => {
                        self.leave().await;
                        break;
                    }
                    Some(command) => {
                        if let Err(e) = self.execute(command).await {
                            warn!("Command failed: {}", e);
                            self.notifier.error(&e);
                        }
                    }
                },
                _ = ticker.tick() => self.tick(Instant::now()).await,
                _ = self.media.screen_ended(), if self.media.is_screen_sharing() => {
                    info!("Screen capture ended, reverting to camera");
                    if let Err(e) = self.stop_screen_share().await {
                        self.notifier.error(&e);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    async fn flush_transport_events(&mut self) {
        while let Ok(event) = self.transport_rx.try_recv() {
            self.handle_transport_event(event).await;
        }
    }
}
