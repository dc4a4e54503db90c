//! One PeerLink per remote member, negotiated by a fixed arrival-order rule.
//!
//! The member who joins later always offers and the one already present
//! always answers, so two members never offer to each other at once. A link
//! that fails, disconnects or never connects is torn down and reported, and
//! other links are unaffected. Nothing reconnects on its own: a retry
//! rebuilds the link from scratch under a fresh link id.

use crate::connection::{LinkState, UiNotifier, ConferenceEvent};
use crate::error::{Error, Result};
use crate::media::{LocalTrack, OutboundTracks};
use crate::protocol::{IceCandidate, MemberId, PeerSignal, Role};
use crate::signaling::SignalingHandle;
use crate::transport::{EventSink, LinkEvent, PeerTransport, TransportEvent, TransportFactory};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Candidates kept per unknown member before its offer arrives.
const MAX_PARKED_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    MemberLeft,
    Disconnected(LinkState),
    NegotiationFailed(String),
    TimedOut,
    LocalLeave,
    /// A fresh link toward the same member takes over.
    Replaced,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::MemberLeft => write!(f, "member left"),
            CloseReason::Disconnected(state) => write!(f, "transport {}", state),
            CloseReason::NegotiationFailed(reason) => write!(f, "negotiation failed: {}", reason),
            CloseReason::TimedOut => write!(f, "connection timed out"),
            CloseReason::LocalLeave => write!(f, "left the room"),
            CloseReason::Replaced => write!(f, "replaced by a new link"),
        }
    }
}

pub struct PeerLink {
    id: u64,
    remote: MemberId,
    role: NegotiationRole,
    state: LinkState,
    transport: Arc<dyn PeerTransport>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    applied_candidates: HashSet<String>,
    outbound_video: Option<String>,
    created_at: Instant,
}

impl PeerLink {
    /// Unique per manager; a recreated link never reuses an id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &MemberId {
        &self.remote
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn outbound_video(&self) -> Option<&str> {
        self.outbound_video.as_deref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.applied_candidates.contains(&candidate.candidate) {
            return Ok(());
        }
        let key = candidate.candidate.clone();
        self.transport.add_ice_candidate(candidate).await?;
        self.applied_candidates.insert(key);
        Ok(())
    }

    /// Marks the remote description applied and feeds every queued candidate in arrival order.
    async fn remote_description_applied(&mut self) -> Result<()> {
        self.remote_description_set = true;
        let queued = std::mem::take(&mut self.pending_candidates);
        if !queued.is_empty() {
            debug!("Flushing {} early candidates for {}", queued.len(), self.remote);
        }
        for candidate in queued {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }
}

pub struct PeerConnectionManager {
    local_role: Role,
    links: HashMap<MemberId, PeerLink>,
    parked: HashMap<MemberId, Vec<IceCandidate>>,
    factory: Arc<dyn TransportFactory>,
    signaling: SignalingHandle,
    notifier: UiNotifier,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    next_link: u64,
    negotiation_timeout: Duration,
}

impl PeerConnectionManager {
    /// Returns the manager and the stream of transport events it expects to be fed.
    pub fn new(
        local_role: Role,
        factory: Arc<dyn TransportFactory>,
        signaling: SignalingHandle,
        notifier: UiNotifier,
        negotiation_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                local_role,
                links: HashMap::new(),
                parked: HashMap::new(),
                factory,
                signaling,
                notifier,
                events_tx,
                next_link: 0,
                negotiation_timeout,
            },
            events_rx,
        )
    }

    pub fn link(&self, remote: &MemberId) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    pub fn remotes(&self) -> Vec<MemberId> {
        self.links.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Allocates a link toward `remote`. An offerer sends its offer right away.
    /// Does nothing if a link to `remote` already exists.
    pub async fn create_link(
        &mut self,
        remote: &MemberId,
        role: NegotiationRole,
        outbound: &OutboundTracks,
    ) -> Result<()> {
        if self.links.contains_key(remote) {
            debug!("Link to {} already exists", remote);
            return Ok(());
        }
        let observer = self.local_role.is_observer();
        if observer && role == NegotiationRole::Offerer {
            return Err(Error::InvalidState("observers never offer".to_string()));
        }
        let outbound = if observer {
            OutboundTracks::default()
        } else {
            outbound.clone()
        };

        self.next_link += 1;
        let id = self.next_link;
        let transport = self
            .factory
            .create(remote, &outbound, EventSink::new(id, self.events_tx.clone()))
            .await
            .map_err(|e| Error::negotiation(remote.clone(), e))?;

        let link = PeerLink {
            id,
            remote: remote.clone(),
            role,
            state: LinkState::New,
            transport,
            remote_description_set: false,
            pending_candidates: self.parked.remove(remote).unwrap_or_default(),
            applied_candidates: HashSet::new(),
            outbound_video: outbound.video.as_ref().map(|t| t.id().to_string()),
            created_at: Instant::now(),
        };
        info!("Link {} to {} created as {:?}", id, remote, role);
        self.links.insert(remote.clone(), link);
        self.notifier.link_state(remote, LinkState::New);

        if role == NegotiationRole::Offerer {
            let offer = match self.transport_of(remote)?.create_offer().await {
                Ok(sdp) => sdp,
                Err(e) => return Err(self.fail(remote, e).await),
            };
            self.send_signal(remote, &PeerSignal::Offer { sdp: offer });
            self.set_state(remote, LinkState::Connecting);
        }
        Ok(())
    }

    pub async fn on_offer(&mut self, from: &MemberId, sdp: String, outbound: &OutboundTracks) -> Result<()> {
        if self.local_role.is_observer() {
            warn!("Observer ignoring offer from {}", from);
            return Ok(());
        }
        // An offer on a negotiated answerer link means the remote rebuilt its side.
        if let Some(link) = self.links.get(from) {
            if link.role == NegotiationRole::Answerer && link.remote_description_set {
                info!("{} sent a new offer, replacing link {}", from, link.id);
                self.teardown(from, CloseReason::Replaced).await;
            }
        }
        if !self.links.contains_key(from) {
            self.create_link(from, NegotiationRole::Answerer, outbound).await?;
        }
        let transport = match self.links.get(from) {
            Some(link) if link.role == NegotiationRole::Answerer => link.transport.clone(),
            Some(_) => {
                let err = Error::negotiation(from.clone(), "unexpected offer");
                return Err(self.fail(from, err).await);
            }
            None => return Ok(()),
        };

        let answer = match transport.accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(from, e).await),
        };
        self.send_signal(from, &PeerSignal::Answer { sdp: answer });
        self.set_state(from, LinkState::Connecting);
        self.after_remote_description(from).await
    }

    pub async fn on_answer(&mut self, from: &MemberId, sdp: String) -> Result<()> {
        let transport = match self.links.get(from) {
            Some(link) if link.role == NegotiationRole::Offerer && !link.remote_description_set => {
                link.transport.clone()
            }
            Some(_) => {
                let err = Error::negotiation(from.clone(), "unexpected answer");
                return Err(self.fail(from, err).await);
            }
            None => {
                debug!("Answer from {} without a link dropped", from);
                return Ok(());
            }
        };
        if let Err(e) = transport.accept_answer(sdp).await {
            return Err(self.fail(from, e).await);
        }
        self.after_remote_description(from).await
    }

    /// Applies a remote candidate, or queues it until the remote description is in place.
    pub async fn on_ice_candidate(&mut self, from: &MemberId, candidate: IceCandidate) -> Result<()> {
        let Some(link) = self.links.get_mut(from) else {
            let parked = self.parked.entry(from.clone()).or_default();
            if parked.len() < MAX_PARKED_CANDIDATES {
                parked.push(candidate);
            }
            return Ok(());
        };
        if !link.remote_description_set {
            link.pending_candidates.push(candidate);
            return Ok(());
        }
        if let Err(e) = link.apply_candidate(candidate).await {
            return Err(self.fail(from, e).await);
        }
        Ok(())
    }

    pub async fn on_member_left(&mut self, remote: &MemberId) {
        self.parked.remove(remote);
        self.teardown(remote, CloseReason::MemberLeft).await;
    }

    /// Rebuilds the link toward `remote` from scratch.
    ///
    /// An offerer sends a fresh offer right away. An answerer only drops the
    /// old link and waits for the remote's new offer.
    pub async fn retry_link(
        &mut self,
        remote: &MemberId,
        role: NegotiationRole,
        outbound: &OutboundTracks,
    ) -> Result<()> {
        self.parked.remove(remote);
        self.teardown(remote, CloseReason::Replaced).await;
        match role {
            NegotiationRole::Offerer => self.create_link(remote, role, outbound).await,
            NegotiationRole::Answerer => {
                debug!("Waiting for {} to offer again", remote);
                Ok(())
            }
        }
    }

    pub async fn on_transport_event(&mut self, LinkEvent { link, event }: LinkEvent) {
        match self.links.get(event.remote()) {
            Some(current) if current.id == link => {}
            Some(current) => {
                debug!(
                    "Event from replaced link {} to {} dropped (current link {})",
                    link,
                    event.remote(),
                    current.id
                );
                return;
            }
            None => {
                debug!("Transport event for closed link {} dropped", event.remote());
                return;
            }
        }
        match event {
            TransportEvent::IceCandidate { remote, candidate } => {
                self.send_signal(&remote, &PeerSignal::IceCandidate { candidate });
            }
            TransportEvent::StateChanged { remote, state } => {
                if state.is_terminal() {
                    self.teardown(&remote, CloseReason::Disconnected(state)).await;
                } else {
                    self.set_state(&remote, state);
                }
            }
            TransportEvent::RemoteTrack {
                remote,
                kind,
                track_id,
            } => {
                debug!("Remote {:?} track {} from {}", kind, track_id, remote);
                self.notifier.emit(ConferenceEvent::RemoteTrack {
                    member: remote,
                    kind,
                    track_id,
                });
            }
        }
    }

    /// Binds `track` as outbound video on every link in one concurrent batch.
    /// Links whose sender rejects the swap are torn down. Returns how many swapped.
    pub async fn replace_outbound_video(&mut self, track: Option<Arc<LocalTrack>>) -> usize {
        let targets: Vec<(MemberId, Arc<dyn PeerTransport>)> = self
            .links
            .iter()
            .map(|(id, link)| (id.clone(), link.transport.clone()))
            .collect();

        let results = join_all(targets.into_iter().map(|(id, transport)| {
            let track = track.clone();
            async move {
                let result = transport.replace_video_track(track).await;
                (id, result)
            }
        }))
        .await;

        let bound = track.as_ref().map(|t| t.id().to_string());
        let mut swapped = 0;
        for (id, result) in results {
            match result {
                Ok(()) => {
                    if let Some(link) = self.links.get_mut(&id) {
                        link.outbound_video = bound.clone();
                        swapped += 1;
                    }
                }
                Err(e) => {
                    warn!("Video swap on link {} failed: {}", id, e);
                    self.teardown(&id, CloseReason::NegotiationFailed(e.to_string()))
                        .await;
                }
            }
        }
        swapped
    }

    /// Tears down links that have not connected within the negotiation timeout.
    pub async fn expire_stale(&mut self, now: Instant) -> Vec<MemberId> {
        let stale: Vec<MemberId> = self
            .links
            .values()
            .filter(|l| l.state != LinkState::Connected)
            .filter(|l| now.saturating_duration_since(l.created_at) >= self.negotiation_timeout)
            .map(|l| l.remote.clone())
            .collect();
        for remote in &stale {
            warn!("Link to {} did not connect in {:?}", remote, self.negotiation_timeout);
            self.teardown(remote, CloseReason::TimedOut).await;
        }
        stale
    }

    pub async fn close_all(&mut self) {
        self.parked.clear();
        for remote in self.remotes() {
            self.teardown(&remote, CloseReason::LocalLeave).await;
        }
    }

    async fn after_remote_description(&mut self, remote: &MemberId) -> Result<()> {
        let Some(link) = self.links.get_mut(remote) else {
            return Ok(());
        };
        if let Err(e) = link.remote_description_applied().await {
            return Err(self.fail(remote, e).await);
        }
        Ok(())
    }

    /// Tears the link down as a negotiation failure and hands the error back.
    async fn fail(&mut self, remote: &MemberId, error: Error) -> Error {
        warn!("Link to {} failed: {}", remote, error);
        self.teardown(remote, CloseReason::NegotiationFailed(error.to_string()))
            .await;
        error
    }

    async fn teardown(&mut self, remote: &MemberId, reason: CloseReason) {
        let Some(link) = self.links.remove(remote) else {
            return;
        };
        if let Err(e) = link.transport.close().await {
            debug!("Closing transport to {} failed: {}", remote, e);
        }
        info!("Link to {} closed: {}", remote, reason);
        self.notifier.link_closed(remote, reason.to_string());
    }

    fn set_state(&mut self, remote: &MemberId, state: LinkState) {
        if let Some(link) = self.links.get_mut(remote) {
            if link.state != state {
                link.state = state;
                self.notifier.link_state(remote, state);
            }
        }
    }

    fn transport_of(&self, remote: &MemberId) -> Result<Arc<dyn PeerTransport>> {
        self.links
            .get(remote)
            .map(|l| l.transport.clone())
            .ok_or_else(|| Error::InvalidState(format!("no link to {}", remote)))
    }

    /// Best effort: a dead signaling channel surfaces later as a link timeout.
    fn send_signal(&self, remote: &MemberId, signal: &PeerSignal) {
        if let Err(e) = self.signaling.relay(remote, signal) {
            warn!("Could not relay to {}: {}", remote, e);
        }
    }
}
