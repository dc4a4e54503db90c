//! Capture device backends.

use crate::error::{Error, Result};
use crate::media::{LocalTrack, MediaChunk, TrackKind, TrackSource};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// A set of tracks from one acquisition, plus whatever keeps them fed.
pub struct CaptureStream {
    tracks: Vec<Arc<LocalTrack>>,
    pumps: Vec<JoinHandle<()>>,
    /// Held only for its Drop, which releases the underlying hardware.
    _guard: Option<Box<dyn std::any::Any + Send + Sync>>,
}

impl CaptureStream {
    pub fn new(tracks: Vec<Arc<LocalTrack>>, pumps: Vec<JoinHandle<()>>) -> Self {
        Self {
            tracks,
            pumps,
            _guard: None,
        }
    }

    pub fn with_guard(mut self, guard: Box<dyn std::any::Any + Send + Sync>) -> Self {
        self._guard = Some(guard);
        self
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn audio(&self) -> Option<Arc<LocalTrack>> {
        self.first_of(TrackKind::Audio)
    }

    pub fn video(&self) -> Option<Arc<LocalTrack>> {
        self.first_of(TrackKind::Video)
    }

    fn first_of(&self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind).cloned()
    }

    /// Ends every track and halts the producers.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        for track in &self.tracks {
            track.stop();
        }
        self._guard = None;
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera plus microphone.
    async fn open_user_media(&self) -> Result<CaptureStream>;

    /// Screen capture. Video only.
    async fn open_display_media(&self) -> Result<CaptureStream>;
}

/// Generates paced dummy samples instead of touching hardware.
pub struct SyntheticDevices {
    deny_camera: AtomicBool,
    deny_screen: AtomicBool,
    user_media_opened: AtomicUsize,
    frame_interval: Duration,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::with_frame_interval(Duration::from_millis(33))
    }

    pub fn with_frame_interval(frame_interval: Duration) -> Self {
        Self {
            deny_camera: AtomicBool::new(false),
            deny_screen: AtomicBool::new(false),
            user_media_opened: AtomicUsize::new(0),
            frame_interval,
        }
    }

    pub fn deny_camera(&self, deny: bool) {
        self.deny_camera.store(deny, Ordering::SeqCst);
    }

    pub fn deny_screen(&self, deny: bool) {
        self.deny_screen.store(deny, Ordering::SeqCst);
    }

    pub fn user_media_opened(&self) -> usize {
        self.user_media_opened.load(Ordering::SeqCst)
    }

    fn pump(track: Arc<LocalTrack>, every: Duration, payload_len: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let payload = Bytes::from(vec![0u8; payload_len]);
            loop {
                ticker.tick().await;
                if track.is_ended() {
                    break;
                }
                let chunk = MediaChunk {
                    data: payload.clone(),
                    duration: every,
                };
                if let Err(e) = track.write(chunk).await {
                    debug!("Synthetic pump for {} stopped: {}", track.id(), e);
                    break;
                }
            }
        })
    }

    pub(crate) fn video_pump(&self, track: Arc<LocalTrack>) -> JoinHandle<()> {
        Self::pump(track, self.frame_interval, 1200)
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_user_media(&self) -> Result<CaptureStream> {
        if self.deny_camera.load(Ordering::SeqCst) {
            return Err(Error::Device("camera access denied".to_string()));
        }
        self.user_media_opened.fetch_add(1, Ordering::SeqCst);
        let audio = LocalTrack::new(TrackSource::Microphone, "camera");
        let video = LocalTrack::new(TrackSource::Camera, "camera");
        let pumps = vec![
            Self::pump(audio.clone(), Duration::from_millis(20), 160),
            self.video_pump(video.clone()),
        ];
        Ok(CaptureStream::new(vec![audio, video], pumps))
    }

    async fn open_display_media(&self) -> Result<CaptureStream> {
        if self.deny_screen.load(Ordering::SeqCst) {
            return Err(Error::Device("screen capture denied".to_string()));
        }
        let video = LocalTrack::new(TrackSource::Screen, "screen");
        let pumps = vec![self.video_pump(video.clone())];
        Ok(CaptureStream::new(vec![video], pumps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_denied_camera_is_retryable() {
        let devices = SyntheticDevices::new();
        devices.deny_camera(true);
        let err = devices.open_user_media().await.err().unwrap();
        assert!(err.is_retryable());
        devices.deny_camera(false);
        let stream = devices.open_user_media().await.unwrap();
        assert!(stream.audio().is_some());
        assert!(stream.video().is_some());
    }

    #[tokio::test]
    async fn test_pumps_feed_taps_until_stopped() {
        let devices = SyntheticDevices::with_frame_interval(Duration::from_millis(2));
        let stream = devices.open_display_media().await.unwrap();
        let track = stream.video().unwrap();
        let mut tap = track.subscribe();
        let chunk = tokio::time::timeout(Duration::from_secs(1), tap.recv()).await;
        assert!(chunk.is_ok());

        stream.stop();
        assert!(track.is_ended());
        tokio::time::timeout(Duration::from_secs(1), track.ended()).await.unwrap();
    }
}
