//! Local media: capture tracks and the controller that owns them.
//!
//! Enabling or disabling a track is purely local and never touches SDP.
//! Screen sharing swaps the outbound video on every PeerLink by track
//! replacement, as one batch.

use crate::devices::{CaptureStream, MediaDevices};
use crate::error::{Error, Result};
use crate::peer::PeerConnectionManager;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const TAP_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    ScreenAudio,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone | TrackSource::ScreenAudio => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

/// One encoded media sample.
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub data: Bytes,
    pub duration: Duration,
}

pub struct LocalTrack {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    ended: AtomicBool,
    ended_notify: Notify,
    rtc: Arc<TrackLocalStaticSample>,
    taps: broadcast::Sender<MediaChunk>,
}

impl LocalTrack {
    pub fn new(source: TrackSource, stream_id: &str) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let mime_type = match source.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        let (taps, _) = broadcast::channel(TAP_CAPACITY);
        Arc::new(Self {
            id,
            source,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            ended_notify: Notify::new(),
            rtc,
            taps,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    /// Observes every sample written while the track is enabled.
    pub fn subscribe(&self) -> broadcast::Receiver<MediaChunk> {
        self.taps.subscribe()
    }

    /// Feeds one sample to every sender bound to this track and to all taps.
    /// Samples written while disabled or after the track ended are dropped.
    pub async fn write(&self, chunk: MediaChunk) -> Result<()> {
        if self.is_ended() || !self.is_enabled() {
            return Ok(());
        }
        let _ = self.taps.send(chunk.clone());
        self.rtc
            .write_sample(&Sample {
                data: chunk.data,
                duration: chunk.duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Ends the track for good and releases anyone waiting in [`LocalTrack::ended`].
    pub fn stop(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            debug!("Track {} ({:?}) ended", self.id, self.source);
            self.ended_notify.notify_waiters();
        }
    }

    pub async fn ended(&self) {
        loop {
            let notified = self.ended_notify.notified();
            if self.is_ended() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Tracks a new PeerLink is wired with.
#[derive(Debug, Clone, Default)]
pub struct OutboundTracks {
    pub audio: Option<Arc<LocalTrack>>,
    pub video: Option<Arc<LocalTrack>>,
}

impl OutboundTracks {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Exclusive owner of the camera/microphone stream and the optional screen stream.
pub struct MediaTrackController {
    devices: Arc<dyn MediaDevices>,
    camera: Option<CaptureStream>,
    screen: Option<CaptureStream>,
}

impl MediaTrackController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            camera: None,
            screen: None,
        }
    }

    /// Acquires camera and microphone. Calling it again while started is a no-op.
    pub async fn start_camera(&mut self) -> Result<()> {
        if self.camera.is_some() {
            return Ok(());
        }
        let stream = self.devices.open_user_media().await?;
        info!("Local capture started ({} tracks)", stream.tracks().len());
        self.camera = Some(stream);
        Ok(())
    }

    pub fn has_camera(&self) -> bool {
        self.camera.is_some()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn camera_audio(&self) -> Option<Arc<LocalTrack>> {
        self.camera.as_ref().and_then(CaptureStream::audio)
    }

    pub fn camera_video(&self) -> Option<Arc<LocalTrack>> {
        self.camera.as_ref().and_then(CaptureStream::video)
    }

    fn screen_video(&self) -> Option<Arc<LocalTrack>> {
        self.screen.as_ref().and_then(CaptureStream::video)
    }

    /// The single video source bound on every PeerLink: screen while sharing, else camera.
    pub fn outbound_video(&self) -> Option<Arc<LocalTrack>> {
        self.screen_video().or_else(|| self.camera_video())
    }

    pub fn outbound(&self) -> OutboundTracks {
        OutboundTracks {
            audio: self.camera_audio(),
            video: self.outbound_video(),
        }
    }

    /// Flips the microphone track. Returns the new enabled state.
    pub fn toggle_audio(&mut self) -> Result<bool> {
        let track = self
            .camera_audio()
            .ok_or_else(|| Error::InvalidState("no local audio track".to_string()))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        debug!("Local audio {}", if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    /// Flips the camera track. Returns the new enabled state.
    pub fn toggle_video(&mut self) -> Result<bool> {
        let track = self
            .camera_video()
            .ok_or_else(|| Error::InvalidState("no local video track".to_string()))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        debug!("Local video {}", if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    /// Used by mute commands. Returns false when there is no audio to mute.
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        match self.camera_audio() {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Acquires a screen stream and binds it as outbound video on every active link.
    pub async fn start_screen_share(&mut self, peers: &mut PeerConnectionManager) -> Result<()> {
        if self.screen.is_some() {
            return Ok(());
        }
        let stream = self.devices.open_display_media().await?;
        let track = stream
            .video()
            .ok_or_else(|| Error::Device("screen capture produced no video track".to_string()))?;
        self.screen = Some(stream);
        let swapped = peers.replace_outbound_video(Some(track)).await;
        info!("Screen share started, swapped video on {} links", swapped);
        Ok(())
    }

    /// Rebinds the camera on every active link and releases the screen capture.
    pub async fn stop_screen_share(&mut self, peers: &mut PeerConnectionManager) -> Result<()> {
        let Some(stream) = self.screen.take() else {
            return Ok(());
        };
        let swapped = peers.replace_outbound_video(self.camera_video()).await;
        stream.stop();
        info!("Screen share stopped, swapped video on {} links", swapped);
        Ok(())
    }

    /// Resolves when the active screen capture ends by itself. Pending while not sharing.
    pub async fn screen_ended(&self) {
        match self.screen_video() {
            Some(track) => track.ended().await,
            None => std::future::pending().await,
        }
    }

    /// Every live local track: camera and microphone, plus screen tracks while sharing.
    pub fn recordable_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.camera
            .iter()
            .chain(self.screen.iter())
            .flat_map(|s| s.tracks().iter().cloned())
            .filter(|t| !t.is_ended())
            .collect()
    }

    /// Stops every capture and frees the devices.
    pub fn release(&mut self) {
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
        debug!("Local media released");
    }
}

impl Drop for MediaTrackController {
    fn drop(&mut self) {
        self.release();
    }
}
