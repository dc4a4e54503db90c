//! webrtc-rs implementation of [`PeerTransport`].

use crate::connection::LinkState;
use crate::error::{Error, Result};
use crate::media::{LocalTrack, OutboundTracks, TrackKind};
use crate::protocol::{IceCandidate, MemberId};
use crate::transport::{EventSink, PeerTransport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Shares one webrtc-rs API object across every link of the session.
pub struct WebRtcFactory {
    api: Arc<API>,
    config: RTCConfiguration,
}

impl WebRtcFactory {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codecs
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Self {
            api: Arc::new(api),
            config,
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        remote: &MemberId,
        outbound: &OutboundTracks,
        events: EventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        if let Some(audio) = &outbound.audio {
            add_sender(&pc, audio).await?;
        }
        let video_sender = match &outbound.video {
            Some(video) => Some(add_sender(&pc, video).await?),
            None => None,
        };

        debug!("Peer connection to {} ready as link {}", remote, events.link());
        wire_callbacks(&pc, remote, events);

        Ok(Arc::new(WebRtcTransport {
            remote: remote.clone(),
            pc,
            video_sender,
        }))
    }
}

async fn add_sender(pc: &RTCPeerConnection, track: &LocalTrack) -> Result<Arc<RTCRtpSender>> {
    let sender = pc
        .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
        .await?;

    // Read incoming RTCP packets so interceptors can process them.
    let rtcp_sender = sender.clone();
    tokio::spawn(async move { while rtcp_sender.read_rtcp().await.is_ok() {} });
    Ok(sender)
}

fn wire_callbacks(pc: &RTCPeerConnection, remote: &MemberId, events: EventSink) {
    let (peer, tx) = (remote.clone(), events.clone());
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let (peer, tx) = (peer.clone(), tx.clone());
        Box::pin(async move {
            // None marks the end of gathering.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::IceCandidate {
                        remote: peer,
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        },
                    });
                }
                Err(e) => warn!("Could not serialize local candidate for {}: {}", peer, e),
            }
        })
    }));

    let (peer, tx) = (remote.clone(), events.clone());
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let (peer, tx) = (peer.clone(), tx.clone());
        Box::pin(async move {
            info!("Peer connection to {} has changed state: {}", peer, s);
            let _ = tx.send(TransportEvent::StateChanged {
                remote: peer,
                state: LinkState::from(s),
            });
        })
    }));

    let (peer, tx) = (remote.clone(), events);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let (peer, tx) = (peer.clone(), tx.clone());
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                let track_id = track.id();
                let _ = tx.send(TransportEvent::RemoteTrack {
                    remote: peer.clone(),
                    kind,
                    track_id: track_id.clone(),
                });
                // Inbound sink: drain packets until the remote side goes away.
                tokio::spawn(async move {
                    let mut packets: u64 = 0;
                    while track.read_rtp().await.is_ok() {
                        packets += 1;
                    }
                    debug!("Remote track {} from {} ended after {} packets", track_id, peer, packets);
                });
            })
        },
    ));
}

pub struct WebRtcTransport {
    remote: MemberId,
    pc: Arc<RTCPeerConnection>,
    video_sender: Option<Arc<RTCRtpSender>>,
}

impl WebRtcTransport {
    fn negotiation_error(&self, e: impl ToString) -> Error {
        Error::negotiation(self.remote.clone(), e)
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp).map_err(|e| self.negotiation_error(e))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| self.negotiation_error(e))?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp).map_err(|e| self.negotiation_error(e))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| self.negotiation_error(e))?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<()> {
        let Some(sender) = &self.video_sender else {
            return Err(self.negotiation_error("link was negotiated without a video slot"));
        };
        let replacement = track.map(|t| t.rtc_track() as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(replacement).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_offer_and_answer_between_two_local_connections() {
        let factory = WebRtcFactory::new(&[]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let outbound = OutboundTracks {
            audio: Some(LocalTrack::new(TrackSource::Microphone, "camera")),
            video: Some(LocalTrack::new(TrackSource::Camera, "camera")),
        };

        let offerer = factory
            .create(&"b".to_string(), &outbound, EventSink::new(1, tx.clone()))
            .await
            .unwrap();
        let answerer = factory
            .create(&"a".to_string(), &OutboundTracks::default(), EventSink::new(2, tx))
            .await
            .unwrap();

        let offer = offerer.create_offer().await.unwrap();
        assert!(offer.contains("m=video"));
        let answer = answerer.accept_offer(offer).await.unwrap();
        offerer.accept_answer(answer).await.unwrap();

        let screen = LocalTrack::new(TrackSource::Screen, "screen");
        offerer.replace_video_track(Some(screen)).await.unwrap();
        assert!(answerer.replace_video_track(None).await.is_err());

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_offer_is_a_negotiation_error() {
        let factory = WebRtcFactory::new(&[]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&"x".to_string(), &OutboundTracks::default(), EventSink::new(1, tx))
            .await
            .unwrap();
        let err = transport.accept_offer("not sdp".into()).await.unwrap_err();
        assert!(matches!(err, Error::Negotiation { .. }));
        transport.close().await.unwrap();
    }
}
