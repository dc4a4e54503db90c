//! Local Recorder.
//!
//! Taps the local tracks while running and writes one `.lrec` artifact on
//! stop. The artifact is a JSON header line followed by chunk records:
//! track index (u16), milliseconds since start (u64), length (u32), bytes.
//! Integers are big-endian.

use crate::error::{Error, Result};
use crate::media::{LocalTrack, MediaChunk, TrackKind, TrackSource};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use futures::stream::{self, select_all, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

const RECORD_HEADER_LEN: usize = 2 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    #[default]
    Idle,
    Recording,
    /// Capture has ended but the artifact is not on disk yet.
    Unsaved,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedTrack {
    pub id: String,
    pub kind: TrackKind,
    pub source: TrackSource,
}

impl RecordedTrack {
    fn of(track: &LocalTrack) -> Self {
        Self {
            id: track.id().to_string(),
            kind: track.kind(),
            source: track.source(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactHeader {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub tracks: Vec<RecordedTrack>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub track: u16,
    pub at_ms: u64,
    pub data: Bytes,
}

/// A decoded `.lrec` file.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub header: ArtifactHeader,
    pub chunks: Vec<ChunkRecord>,
}

type Tap = BoxStream<'static, (u16, MediaChunk)>;

struct RecordingSession {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    tracks: Vec<RecordedTrack>,
    taps_tx: mpsc::UnboundedSender<Tap>,
    stop_tx: oneshot::Sender<()>,
    sink: JoinHandle<Vec<ChunkRecord>>,
}

/// An encoded artifact waiting for a successful write.
struct UnsavedArtifact {
    session_id: Uuid,
    ended_at: DateTime<Utc>,
    chunks: usize,
    bytes: Bytes,
}

pub struct LocalRecorder {
    output_dir: PathBuf,
    state: RecorderState,
    session: Option<RecordingSession>,
    unsaved: Option<UnsavedArtifact>,
}

impl LocalRecorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            state: RecorderState::Idle,
            session: None,
            unsaved: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    /// True while there is something a call to [`stop`](Self::stop) would save.
    pub fn has_pending_artifact(&self) -> bool {
        matches!(self.state, RecorderState::Recording | RecorderState::Unsaved)
    }

    /// Starts buffering every sample written to `tracks` from now on.
    pub fn start(&mut self, tracks: Vec<Arc<LocalTrack>>) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::InvalidState("a recording is already running".to_string()));
        }
        if self.unsaved.is_some() {
            return Err(Error::InvalidState(
                "the previous recording has not been saved yet".to_string(),
            ));
        }
        let tracks: Vec<_> = tracks.into_iter().filter(|t| !t.is_ended()).collect();
        if tracks.is_empty() {
            return Err(Error::NothingToRecord);
        }

        let taps: Vec<_> = tracks
            .iter()
            .enumerate()
            .map(|(index, track)| tap(index as u16, track.subscribe()))
            .collect();
        let (taps_tx, taps_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let sink = tokio::spawn(collect(select_all(taps), taps_rx, stop_rx));

        let session = RecordingSession {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            tracks: tracks.iter().map(|t| RecordedTrack::of(t)).collect(),
            taps_tx,
            stop_tx,
            sink,
        };
        info!(
            "Recording {} started with {} tracks",
            session.session_id,
            session.tracks.len()
        );
        self.session = Some(session);
        self.state = RecorderState::Recording;
        Ok(())
    }

    /// Adds a track that went live after the recording started.
    ///
    /// Returns `false` if the track is ended or already being recorded.
    pub fn add_track(&mut self, track: Arc<LocalTrack>) -> Result<bool> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no recording is running".to_string()))?;
        if track.is_ended() || session.tracks.iter().any(|t| t.id == track.id()) {
            return Ok(false);
        }
        let index = u16::try_from(session.tracks.len())
            .map_err(|_| Error::Recording("too many recorded tracks".to_string()))?;
        session
            .taps_tx
            .send(tap(index, track.subscribe()))
            .map_err(|_| Error::Recording("recording sink is gone".to_string()))?;
        session.tracks.push(RecordedTrack::of(&track));
        info!(
            "Recording {} now includes {:?} track {}",
            session.session_id,
            track.source(),
            track.id()
        );
        Ok(true)
    }

    /// Finalizes the buffered chunks into exactly one artifact and returns its path.
    ///
    /// If the write fails the encoded artifact is kept and the next call
    /// retries the write.
    pub async fn stop(&mut self) -> Result<PathBuf> {
        if let Some(session) = self.session.take() {
            match finish(session).await {
                Ok(unsaved) => {
                    self.unsaved = Some(unsaved);
                    self.state = RecorderState::Unsaved;
                }
                Err(e) => {
                    self.state = RecorderState::Stopped;
                    return Err(e);
                }
            }
        }
        let unsaved = self
            .unsaved
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no recording is running".to_string()))?;

        let path = self.output_dir.join(format!(
            "recording-{}.lrec",
            unsaved.ended_at.format("%Y%m%dT%H%M%S%.3fZ")
        ));
        if let Err(e) = write_artifact(&self.output_dir, &path, &unsaved.bytes).await {
            warn!(
                "Recording {} could not be written to {}: {}",
                unsaved.session_id,
                path.display(),
                e
            );
            return Err(e);
        }
        info!(
            "Recording {} saved to {} ({} chunks)",
            unsaved.session_id,
            path.display(),
            unsaved.chunks
        );
        self.unsaved = None;
        self.state = RecorderState::Stopped;
        Ok(path)
    }
}

async fn finish(session: RecordingSession) -> Result<UnsavedArtifact> {
    let _ = session.stop_tx.send(());
    let chunks = session
        .sink
        .await
        .map_err(|e| Error::Recording(format!("recording sink failed: {}", e)))?;

    let ended_at = Utc::now();
    let header = ArtifactHeader {
        session_id: session.session_id,
        started_at: session.started_at,
        ended_at,
        tracks: session.tracks,
    };
    Ok(UnsavedArtifact {
        session_id: header.session_id,
        ended_at,
        chunks: chunks.len(),
        bytes: encode(&header, &chunks)?,
    })
}

async fn write_artifact(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

fn tap(index: u16, rx: broadcast::Receiver<MediaChunk>) -> Tap {
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(chunk) => return Some(((index, chunk), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Recorder fell behind on track {}, lost {} chunks", index, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

async fn collect(
    mut taps: stream::SelectAll<Tap>,
    mut new_taps: mpsc::UnboundedReceiver<Tap>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Vec<ChunkRecord> {
    let started = Instant::now();
    let mut chunks = Vec::new();
    let mut record = |(track, chunk): (u16, MediaChunk)| {
        chunks.push(ChunkRecord {
            track,
            at_ms: started.elapsed().as_millis() as u64,
            data: chunk.data,
        });
    };

    // Every tap may end while a new one can still arrive, so only the stop request ends the loop.
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            Some(tap) = new_taps.recv() => taps.push(tap),
            Some(item) = taps.next(), if !taps.is_empty() => record(item),
        }
    }
    // Whatever was written before the stop request still belongs to the recording.
    while let Ok(tap) = new_taps.try_recv() {
        taps.push(tap);
    }
    while let Some(Some(item)) = taps.next().now_or_never() {
        record(item);
    }
    chunks
}

fn encode(header: &ArtifactHeader, chunks: &[ChunkRecord]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_slice(&serde_json::to_vec(header)?);
    buf.put_u8(b'\n');
    for chunk in chunks {
        let len = u32::try_from(chunk.data.len())
            .map_err(|_| Error::Recording("chunk larger than 4 GiB".to_string()))?;
        buf.put_u16(chunk.track);
        buf.put_u64(chunk.at_ms);
        buf.put_u32(len);
        buf.put_slice(&chunk.data);
    }
    Ok(buf.freeze())
}

pub fn decode(bytes: &[u8]) -> Result<Artifact> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| Error::Recording("missing artifact header".to_string()))?;
    let header: ArtifactHeader = serde_json::from_slice(&bytes[..newline])?;

    let mut body = &bytes[newline + 1..];
    let mut chunks = Vec::new();
    while body.has_remaining() {
        if body.remaining() < RECORD_HEADER_LEN {
            return Err(Error::Recording("truncated chunk record".to_string()));
        }
        let track = body.get_u16();
        let at_ms = body.get_u64();
        let len = body.get_u32() as usize;
        if body.remaining() < len {
            return Err(Error::Recording("truncated chunk payload".to_string()));
        }
        let data = Bytes::copy_from_slice(&body[..len]);
        body.advance(len);
        if usize::from(track) >= header.tracks.len() {
            return Err(Error::Recording(format!("chunk for unknown track {}", track)));
        }
        chunks.push(ChunkRecord { track, at_ms, data });
    }
    Ok(Artifact { header, chunks })
}

pub async fn read_artifact(path: &Path) -> Result<Artifact> {
    let bytes = tokio::fs::read(path).await?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn chunk(data: &'static [u8]) -> MediaChunk {
        MediaChunk {
            data: Bytes::from_static(data),
            duration: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_nothing_to_record() {
        let dir = TempDir::new().unwrap();
        let mut recorder = LocalRecorder::new(dir.path());
        assert!(matches!(recorder.start(Vec::new()), Err(Error::NothingToRecord)));

        let ended = LocalTrack::new(TrackSource::Camera, "camera");
        ended.stop();
        assert!(matches!(recorder.start(vec![ended]), Err(Error::NothingToRecord)));
        assert_eq!(recorder.state(), RecorderState::Idle);
    }

    #[tokio::test]
    async fn test_stop_writes_exactly_one_artifact() {
        let dir = TempDir::new().unwrap();
        let mut recorder = LocalRecorder::new(dir.path().join("out"));
        let mic = LocalTrack::new(TrackSource::Microphone, "camera");
        let cam = LocalTrack::new(TrackSource::Camera, "camera");

        mic.write(chunk(b"before")).await.unwrap();
        recorder.start(vec![mic.clone(), cam.clone()]).unwrap();
        assert!(matches!(recorder.start(vec![mic.clone()]), Err(Error::InvalidState(_))));

        mic.write(chunk(b"a1")).await.unwrap();
        cam.write(chunk(b"v1")).await.unwrap();
        mic.write(chunk(b"a2")).await.unwrap();

        let path = recorder.stop().await.unwrap();
        assert_eq!(recorder.state(), RecorderState::Stopped);
        assert!(recorder.stop().await.is_err());
        assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 1);
        assert!(path.extension().map_or(false, |e| e == "lrec"));

        let artifact = read_artifact(&path).await.unwrap();
        assert_eq!(artifact.header.tracks.len(), 2);
        assert_eq!(artifact.header.tracks[0].source, TrackSource::Microphone);
        let mic_chunks: Vec<_> = artifact
            .chunks
            .iter()
            .filter(|c| c.track == 0)
            .map(|c| c.data.clone())
            .collect();
        assert_eq!(mic_chunks, vec![Bytes::from_static(b"a1"), Bytes::from_static(b"a2")]);
        assert_eq!(artifact.chunks.len(), 3);
    }

    #[tokio::test]
    async fn test_track_added_mid_recording_is_captured() {
        let dir = TempDir::new().unwrap();
        let mut recorder = LocalRecorder::new(dir.path());
        let mic = LocalTrack::new(TrackSource::Microphone, "camera");
        let screen = LocalTrack::new(TrackSource::Screen, "screen");
        assert!(matches!(recorder.add_track(screen.clone()), Err(Error::InvalidState(_))));

        recorder.start(vec![mic.clone()]).unwrap();
        mic.write(chunk(b"a1")).await.unwrap();
        screen.write(chunk(b"too early")).await.unwrap();
        assert!(recorder.add_track(screen.clone()).unwrap());
        assert!(!recorder.add_track(screen.clone()).unwrap());
        assert!(!recorder.add_track(mic.clone()).unwrap());

        screen.write(chunk(b"s1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        screen.write(chunk(b"s2")).await.unwrap();
        mic.write(chunk(b"a2")).await.unwrap();

        let artifact = read_artifact(&recorder.stop().await.unwrap()).await.unwrap();
        let sources: Vec<_> = artifact.header.tracks.iter().map(|t| t.source).collect();
        assert_eq!(sources, vec![TrackSource::Microphone, TrackSource::Screen]);
        assert_eq!(artifact.header.tracks[1].id, screen.id());
        let screen_chunks: Vec<_> = artifact
            .chunks
            .iter()
            .filter(|c| c.track == 1)
            .map(|c| c.data.clone())
            .collect();
        assert_eq!(screen_chunks, vec![Bytes::from_static(b"s1"), Bytes::from_static(b"s2")]);
        assert_eq!(artifact.chunks.iter().filter(|c| c.track == 0).count(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_the_recording_for_a_retry() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut recorder = LocalRecorder::new(blocker.join("out"));
        let mic = LocalTrack::new(TrackSource::Microphone, "camera");

        recorder.start(vec![mic.clone()]).unwrap();
        mic.write(chunk(b"a1")).await.unwrap();
        mic.write(chunk(b"a2")).await.unwrap();

        assert!(matches!(recorder.stop().await, Err(Error::Io(_))));
        assert_eq!(recorder.state(), RecorderState::Unsaved);
        assert!(recorder.has_pending_artifact());
        assert!(matches!(recorder.start(vec![mic.clone()]), Err(Error::InvalidState(_))));
        // Written after capture ended, so not part of the artifact.
        mic.write(chunk(b"late")).await.unwrap();

        std::fs::remove_file(&blocker).unwrap();
        let path = recorder.stop().await.unwrap();
        assert_eq!(recorder.state(), RecorderState::Stopped);
        assert!(!recorder.has_pending_artifact());
        let artifact = read_artifact(&path).await.unwrap();
        let data: Vec<_> = artifact.chunks.iter().map(|c| c.data.clone()).collect();
        assert_eq!(data, vec![Bytes::from_static(b"a1"), Bytes::from_static(b"a2")]);
        assert!(matches!(recorder.stop().await, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_truncated_artifact_is_rejected() {
        let header = ArtifactHeader {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            tracks: vec![RecordedTrack {
                id: "t".into(),
                kind: TrackKind::Audio,
                source: TrackSource::Microphone,
            }],
        };
        let chunks = vec![ChunkRecord {
            track: 0,
            at_ms: 5,
            data: Bytes::from_static(b"payload"),
        }];
        let bytes = encode(&header, &chunks).unwrap();
        assert_eq!(decode(&bytes).unwrap().chunks, chunks);
        assert!(decode(&bytes[..bytes.len() - 3]).is_err());
        assert!(decode(b"no header").is_err());
    }
}
