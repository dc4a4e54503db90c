//! Microphone capture from the default cpal input device.
//!
//! `cpal::Stream` is not `Send`, so each capture lives on its own thread and
//! hands PCM chunks to the async side over a channel. Opening the device
//! happens on that thread too; the caller awaits the outcome.

use crate::devices::{CaptureStream, MediaDevices, SyntheticDevices};
use crate::error::{Error, Result};
use crate::media::{LocalTrack, MediaChunk, TrackSource};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

const CHUNK_QUEUE: usize = 64;

type DeviceReady = std::result::Result<(), String>;

pub struct MicrophoneCapture {
    stop_tx: std::sync::mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneCapture {
    pub async fn start(track: Arc<LocalTrack>) -> Result<(Self, tokio::task::JoinHandle<()>)> {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<MediaChunk>(CHUNK_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel::<DeviceReady>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = thread::spawn(move || {
            let stream = match open_input_stream(chunk_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            // Park until asked to stop; dropping the stream releases the device.
            let _ = stop_rx.recv();
            drop(stream);
        });

        wait_ready(ready_rx).await?;

        let pump = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                if track.is_ended() {
                    break;
                }
                if let Err(e) = track.write(chunk).await {
                    warn!("Failed to write microphone sample: {}", e);
                }
            }
        });

        Ok((
            Self {
                stop_tx,
                thread: Some(thread),
            },
            pump,
        ))
    }
}

async fn wait_ready(ready_rx: oneshot::Receiver<DeviceReady>) -> Result<()> {
    match ready_rx.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Device(e)),
        Err(_) => Err(Error::Device("microphone thread exited".to_string())),
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn open_input_stream(chunk_tx: mpsc::Sender<MediaChunk>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let input_device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("No input device available".to_string()))?;

    let config = input_device
        .default_input_config()
        .map_err(|e| Error::Device(e.to_string()))?;
    info!("Input config: {:?}", config);

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&input_device, &config.into(), chunk_tx)?,
        SampleFormat::I16 => build_input_stream::<i16>(&input_device, &config.into(), chunk_tx)?,
        SampleFormat::U16 => build_input_stream::<u16>(&input_device, &config.into(), chunk_tx)?,
        sample_format => {
            return Err(Error::Device(format!(
                "Unsupported sample format: {:?}",
                sample_format
            )))
        }
    };

    stream.play().map_err(|e| Error::Device(e.to_string()))?;
    Ok(stream)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    chunk_tx: mpsc::Sender<MediaChunk>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    let err_fn = |err| error!("An error occurred on the input audio stream: {}", err);
    let frame_rate = config.sample_rate.0.max(1) as u64;
    let channels = config.channels.max(1) as u64;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut pcm = BytesMut::with_capacity(data.len() * 2);
                for sample in data {
                    pcm.put_i16_le(sample.to_sample::<i16>());
                }
                let frames = data.len() as u64 / channels;
                let chunk = MediaChunk {
                    data: Bytes::from(pcm),
                    duration: Duration::from_micros(frames * 1_000_000 / frame_rate),
                };
                // Full queue means the async side is behind; drop rather than block the audio thread.
                let _ = chunk_tx.try_send(chunk);
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))?;

    Ok(stream)
}

/// Real microphone, synthetic camera and screen.
pub struct NativeDevices {
    synthetic: SyntheticDevices,
}

impl NativeDevices {
    pub fn new() -> Self {
        Self {
            synthetic: SyntheticDevices::new(),
        }
    }
}

impl Default for NativeDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for NativeDevices {
    async fn open_user_media(&self) -> Result<CaptureStream> {
        let audio = LocalTrack::new(TrackSource::Microphone, "camera");
        let video = LocalTrack::new(TrackSource::Camera, "camera");
        let (capture, audio_pump) = MicrophoneCapture::start(audio.clone()).await?;
        let video_pump = self.synthetic.video_pump(video.clone());
        Ok(CaptureStream::new(vec![audio, video], vec![audio_pump, video_pump])
            .with_guard(Box::new(capture)))
    }

    async fn open_display_media(&self) -> Result<CaptureStream> {
        self.synthetic.open_display_media().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn test_waiting_for_the_device_leaves_the_runtime_free() {
        let (ready_tx, ready_rx) = oneshot::channel::<DeviceReady>();
        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _ = ready_tx.send(Ok(()));
        });
        let ticker = tokio::spawn(tokio::time::sleep(Duration::from_millis(10)));

        wait_ready(ready_rx).await.unwrap();
        assert!(ticker.is_finished());
        opener.join().unwrap();
    }

    #[tokio::test]
    async fn test_device_errors_surface_as_device_errors() {
        let (ready_tx, ready_rx) = oneshot::channel::<DeviceReady>();
        ready_tx.send(Err("no input device".to_string())).unwrap();
        assert!(matches!(wait_ready(ready_rx).await, Err(Error::Device(_))));

        let (ready_tx, ready_rx) = oneshot::channel::<DeviceReady>();
        drop(ready_tx);
        assert!(matches!(wait_ready(ready_rx).await, Err(Error::Device(_))));
    }
}
