//! The media transport behind a PeerLink.
//!
//! The peer manager drives negotiation through [`PeerTransport`] and learns
//! about asynchronous transport activity through [`TransportEvent`]s, so
//! links can be exercised with synthetic messages and no network.
//!
//! Every transport reports through an [`EventSink`] stamped with the id of
//! the link it was built for. A link recreated toward the same member gets a
//! new id, so late events from the transport it replaced can be told apart.

use crate::connection::LinkState;
use crate::error::Result;
use crate::media::{LocalTrack, OutboundTracks, TrackKind};
use crate::protocol::{IceCandidate, MemberId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local candidate was gathered and should be relayed to `remote`.
    IceCandidate {
        remote: MemberId,
        candidate: IceCandidate,
    },
    StateChanged {
        remote: MemberId,
        state: LinkState,
    },
    /// Remote media arrived and is attached to an inbound sink.
    RemoteTrack {
        remote: MemberId,
        kind: TrackKind,
        track_id: String,
    },
}

impl TransportEvent {
    pub fn remote(&self) -> &MemberId {
        match self {
            TransportEvent::IceCandidate { remote, .. }
            | TransportEvent::StateChanged { remote, .. }
            | TransportEvent::RemoteTrack { remote, .. } => remote,
        }
    }
}

/// A [`TransportEvent`] tagged with the link that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub link: u64,
    pub event: TransportEvent,
}

#[derive(Debug, Clone)]
pub struct EventSink {
    link: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl EventSink {
    pub fn new(link: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { link, tx }
    }

    pub fn link(&self) -> u64 {
        self.link
    }

    /// Returns false once nobody is listening any more.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx
            .send(LinkEvent {
                link: self.link,
                event,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer, applies it locally and returns its SDP.
    async fn create_offer(&self) -> Result<String>;

    /// Applies a remote offer and returns the local answer SDP.
    async fn accept_offer(&self, sdp: String) -> Result<String>;

    async fn accept_answer(&self, sdp: String) -> Result<()>;

    /// Only valid once a remote description has been applied.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Swaps the source feeding the outbound video slot without renegotiating.
    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Builds a transport toward `remote` wired with `outbound` tracks.
    /// Asynchronous activity is reported on `events`.
    async fn create(
        &self,
        remote: &MemberId,
        outbound: &OutboundTracks,
        events: EventSink,
    ) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        remote_description: bool,
        offers_created: usize,
        answers_created: usize,
        candidates: Vec<IceCandidate>,
        bound_video: Option<String>,
        bound_audio: Option<String>,
        closed: bool,
    }

    /// Records everything done to it. SDP that starts with "bad" is rejected.
    pub struct MockTransport {
        remote: MemberId,
        inner: Mutex<Inner>,
        events: EventSink,
        fail_replace: Mutex<bool>,
    }

    impl MockTransport {
        pub fn offers_created(&self) -> usize {
            self.inner.lock().unwrap().offers_created
        }

        pub fn answers_created(&self) -> usize {
            self.inner.lock().unwrap().answers_created
        }

        pub fn candidates(&self) -> Vec<IceCandidate> {
            self.inner.lock().unwrap().candidates.clone()
        }

        pub fn bound_video(&self) -> Option<String> {
            self.inner.lock().unwrap().bound_video.clone()
        }

        pub fn bound_audio(&self) -> Option<String> {
            self.inner.lock().unwrap().bound_audio.clone()
        }

        pub fn is_closed(&self) -> bool {
            self.inner.lock().unwrap().closed
        }

        pub fn link(&self) -> u64 {
            self.events.link()
        }

        pub fn fail_next_replace(&self) {
            *self.fail_replace.lock().unwrap() = true;
        }

        /// Pretends the transport changed state, as ICE would.
        pub fn emit_state(&self, state: LinkState) {
            let _ = self.events.send(TransportEvent::StateChanged {
                remote: self.remote.clone(),
                state,
            });
        }

        pub fn emit_candidate(&self, candidate: &str) {
            let _ = self.events.send(TransportEvent::IceCandidate {
                remote: self.remote.clone(),
                candidate: IceCandidate::new(candidate),
            });
        }

        fn check_sdp(&self, sdp: &str) -> Result<()> {
            if sdp.starts_with("bad") {
                return Err(Error::negotiation(self.remote.clone(), "malformed session description"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn create_offer(&self) -> Result<String> {
            let mut inner = self.inner.lock().unwrap();
            inner.offers_created += 1;
            Ok(format!("offer-to-{}-{}", self.remote, inner.offers_created))
        }

        async fn accept_offer(&self, sdp: String) -> Result<String> {
            self.check_sdp(&sdp)?;
            let mut inner = self.inner.lock().unwrap();
            inner.remote_description = true;
            inner.answers_created += 1;
            Ok(format!("answer-to-{}", self.remote))
        }

        async fn accept_answer(&self, sdp: String) -> Result<()> {
            self.check_sdp(&sdp)?;
            self.inner.lock().unwrap().remote_description = true;
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            if candidate.candidate.starts_with("bad") {
                return Err(Error::negotiation(self.remote.clone(), "malformed candidate"));
            }
            let mut inner = self.inner.lock().unwrap();
            if !inner.remote_description {
                return Err(Error::negotiation(self.remote.clone(), "no remote description"));
            }
            inner.candidates.push(candidate);
            Ok(())
        }

        async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<()> {
            if std::mem::take(&mut *self.fail_replace.lock().unwrap()) {
                return Err(Error::negotiation(self.remote.clone(), "sender gone"));
            }
            self.inner.lock().unwrap().bound_video = track.map(|t| t.id().to_string());
            Ok(())
        }

        /// Like a real peer connection, closing reports a final `Closed` state.
        async fn close(&self) -> Result<()> {
            let was_closed = std::mem::replace(&mut self.inner.lock().unwrap().closed, true);
            if !was_closed {
                self.emit_state(LinkState::Closed);
            }
            Ok(())
        }
    }

    /// Hands out [`MockTransport`]s and keeps the latest one per remote for inspection.
    #[derive(Clone, Default)]
    pub struct MockFactory {
        transports: Arc<Mutex<HashMap<MemberId, Arc<MockTransport>>>>,
        created: Arc<Mutex<Vec<MemberId>>>,
    }

    impl MockFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn transport(&self, remote: &str) -> Option<Arc<MockTransport>> {
            self.transports.lock().unwrap().get(remote).cloned()
        }

        pub fn created(&self) -> Vec<MemberId> {
            self.created.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn create(
            &self,
            remote: &MemberId,
            outbound: &OutboundTracks,
            events: EventSink,
        ) -> Result<Arc<dyn PeerTransport>> {
            let transport = Arc::new(MockTransport {
                remote: remote.clone(),
                inner: Mutex::new(Inner {
                    bound_video: outbound.video.as_ref().map(|t| t.id().to_string()),
                    bound_audio: outbound.audio.as_ref().map(|t| t.id().to_string()),
                    ..Default::default()
                }),
                events,
                fail_replace: Mutex::new(false),
            });
            self.transports
                .lock()
                .unwrap()
                .insert(remote.clone(), transport.clone());
            self.created.lock().unwrap().push(remote.clone());
            Ok(transport)
        }
    }
}
