//! Microphone capture pipeline
//!
//! Owns an [`AudioInput`] for the duration of a capture, converts whatever
//! the device delivers to 16kHz mono, cuts it into fixed-size frames and
//! hands each encoded frame plus its level to a callback.
//!
//! Delivery to the callback runs on its own task behind a small
//! drop-oldest buffer, so a slow consumer never stalls the framing loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{AudioBackendConfig, AudioFrame, AudioInput};
use super::pcm::{self, Resampler, PCM_MIME_TYPE};
use crate::error::CaptureError;
use crate::transport::MediaChunk;

/// One encoded capture frame ready for the wire
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub chunk: MediaChunk,
    /// Instantaneous level of the frame in [0, 100]
    pub level: f32,
    /// Capture timestamp of the first sample, ms since capture start
    pub timestamp_ms: u64,
    pub sequence: u64,
}

/// Callback invoked for every captured frame
pub type FrameCallback = Box<dyn FnMut(CapturedFrame) + Send + 'static>;

struct ActiveCapture {
    input: Box<dyn AudioInput>,
    framing_task: JoinHandle<()>,
    delivery_task: JoinHandle<()>,
    started_at: Instant,
}

/// Capture pipeline: device → resample → frame → encode → callback
pub struct CapturePipeline {
    config: AudioBackendConfig,
    active: Option<ActiveCapture>,
    level_tx: watch::Sender<f32>,
    dropped_frames: Arc<AtomicU64>,
}

impl CapturePipeline {
    pub fn new(config: AudioBackendConfig) -> Self {
        let (level_tx, _) = watch::channel(0.0);
        Self {
            config,
            active: None,
            level_tx,
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start capturing from `input`, invoking `on_frame` for every frame.
    ///
    /// On failure the input is handed back untouched.
    pub async fn start(
        &mut self,
        mut input: Box<dyn AudioInput>,
        on_frame: FrameCallback,
    ) -> Result<(), (CaptureError, Box<dyn AudioInput>)> {
        if self.active.is_some() {
            return Err((CaptureError::AlreadyActive, input));
        }

        info!(
            "Starting capture on {} ({}Hz mono, {} samples/frame, aec={}, ns={}, agc={})",
            input.name(),
            self.config.target_sample_rate,
            self.config.frame_samples,
            self.config.echo_cancellation,
            self.config.noise_suppression,
            self.config.auto_gain_control
        );

        let device_rx = match input.start().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Capture device {} failed to start: {}", input.name(), e);
                return Err((e, input));
            }
        };

        let (frame_tx, frame_rx) = broadcast::channel(self.config.max_pending_frames.max(1));

        let framing_task = tokio::spawn(framing_loop(
            device_rx,
            frame_tx,
            self.config.target_sample_rate,
            self.config.frame_samples,
        ));
        let delivery_task = tokio::spawn(delivery_loop(
            frame_rx,
            on_frame,
            self.level_tx.clone(),
            Arc::clone(&self.dropped_frames),
        ));

        self.active = Some(ActiveCapture {
            input,
            framing_task,
            delivery_task,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Stop capturing and release the device.
    ///
    /// Returns the input so it can be started again. Calling this while not
    /// capturing is a no-op that returns `None`.
    pub async fn stop(&mut self) -> Option<Box<dyn AudioInput>> {
        let mut active = self.active.take()?;

        active.framing_task.abort();
        active.delivery_task.abort();
        let _ = (&mut active.framing_task).await;
        let _ = (&mut active.delivery_task).await;

        if let Err(e) = active.input.stop().await {
            warn!("Failed to stop capture device {}: {}", active.input.name(), e);
        }
        self.level_tx.send_replace(0.0);

        info!(
            "Capture stopped after {:.1}s ({} frames dropped so far)",
            active.started_at.elapsed().as_secs_f64(),
            self.dropped_frames.load(Ordering::Relaxed)
        );
        Some(active.input)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Observable capture level in [0, 100]
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level_tx.subscribe()
    }

    /// Frames dropped because the consumer fell behind
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

/// Accumulates device audio into fixed-size encoded frames.
///
/// Frames are published on a bounded broadcast channel: when the consumer
/// lags, the oldest frames are overwritten and sending never waits.
async fn framing_loop(
    mut device_rx: tokio::sync::mpsc::Receiver<AudioFrame>,
    frame_tx: broadcast::Sender<CapturedFrame>,
    target_rate: u32,
    frame_samples: usize,
) {
    let mut source_rate: Option<u32> = None;
    let mut resampler = Resampler::new(target_rate, target_rate);
    let mut pending: Vec<f32> = Vec::with_capacity(frame_samples * 2);
    let mut emitted: u64 = 0;

    while let Some(frame) = device_rx.recv().await {
        let mono = pcm::downmix_to_mono(&frame.samples, frame.channels);

        if source_rate != Some(frame.sample_rate) {
            debug!("Capture resampling {}Hz -> {}Hz", frame.sample_rate, target_rate);
            source_rate = Some(frame.sample_rate);
            resampler = Resampler::new(frame.sample_rate, target_rate);
        }
        pending.extend(resampler.process(&mono));

        while pending.len() >= frame_samples {
            let block: Vec<f32> = pending.drain(..frame_samples).collect();
            let level = pcm::rms_level(&block);
            let bytes = pcm::samples_to_bytes(&block);
            let timestamp_ms = emitted * frame_samples as u64 * 1000 / target_rate as u64;

            let captured = CapturedFrame {
                chunk: MediaChunk {
                    mime_type: PCM_MIME_TYPE.to_string(),
                    data: pcm::to_base64(&bytes),
                },
                level,
                timestamp_ms,
                sequence: emitted,
            };
            emitted += 1;

            // Err only means nobody is listening right now.
            let _ = frame_tx.send(captured);
        }
    }

    debug!("Capture device stream ended after {} frames", emitted);
}

async fn delivery_loop(
    mut frame_rx: broadcast::Receiver<CapturedFrame>,
    mut on_frame: FrameCallback,
    level_tx: watch::Sender<f32>,
    dropped: Arc<AtomicU64>,
) {
    loop {
        match frame_rx.recv().await {
            Ok(frame) => {
                level_tx.send_replace(frame.level);
                on_frame(frame);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                dropped.fetch_add(n, Ordering::Relaxed);
                warn!("Capture consumer lagging, dropped {} oldest frames", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    level_tx.send_replace(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::ChannelInput;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn device_frame(samples: usize, rate: u32, channels: u16, value: f32) -> AudioFrame {
        AudioFrame {
            samples: vec![value; samples * channels as usize],
            sample_rate: rate,
            channels,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_emits_fixed_size_frames() {
        let (input, sender) = ChannelInput::new();
        let mut pipeline = CapturePipeline::new(AudioBackendConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        pipeline
            .start(Box::new(input), Box::new(move |f| {
                let _ = tx.send(f);
            }))
            .await
            .map_err(|(e, _)| e)
            .unwrap();

        // 3 x 3000 samples = 9000 → two full 4096-sample frames
        for _ in 0..3 {
            sender.push(device_frame(3000, 16_000, 1, 0.5));
        }

        for expected_seq in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.sequence, expected_seq);
            assert_eq!(frame.chunk.mime_type, "audio/pcm");
            let bytes = pcm::from_base64(&frame.chunk.data).unwrap();
            assert_eq!(bytes.len(), 4096 * 2);
            assert!((frame.level - 50.0).abs() < 0.1);
        }

        assert!(pipeline.stop().await.is_some());
        assert_eq!(*pipeline.level().borrow(), 0.0);
    }

    #[tokio::test]
    async fn test_resamples_and_downmixes_device_audio() {
        let (input, sender) = ChannelInput::new();
        let mut pipeline = CapturePipeline::new(AudioBackendConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        pipeline
            .start(Box::new(input), Box::new(move |f| {
                let _ = tx.send(f);
            }))
            .await
            .map_err(|(e, _)| e)
            .unwrap();

        // 48kHz stereo, 12288 frames → 4096 samples at 16kHz
        sender.push(device_frame(12_300, 48_000, 2, 0.25));

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let samples = pcm::decode_frame(&pcm::from_base64(&frame.chunk.data).unwrap()).unwrap();
        assert_eq!(samples.len(), 4096);
        assert!(samples.iter().all(|s| (s - 0.25).abs() < 1e-3));

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_already_active() {
        let (first, _s1) = ChannelInput::new();
        let (second, _s2) = ChannelInput::new();
        let mut pipeline = CapturePipeline::new(AudioBackendConfig::default());

        pipeline
            .start(Box::new(first), Box::new(|_| {}))
            .await
            .map_err(|(e, _)| e)
            .unwrap();
        let err = pipeline.start(Box::new(second), Box::new(|_| {})).await;
        assert!(matches!(err, Err((CaptureError::AlreadyActive, _))));

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut pipeline = CapturePipeline::new(AudioBackendConfig::default());
        assert!(pipeline.stop().await.is_none());
        assert!(!pipeline.is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_consumer_drops_oldest() {
        let (input, sender) = ChannelInput::new();
        let mut pipeline = CapturePipeline::new(AudioBackendConfig {
            max_pending_frames: 2,
            ..Default::default()
        });
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (blocked_tx, mut blocked_rx) = mpsc::unbounded_channel::<()>();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        pipeline
            .start(Box::new(input), Box::new(move |f| {
                // First frame blocks until released, everything behind it piles up
                if f.sequence == 0 {
                    let _ = blocked_tx.send(());
                    let _ = release_rx.recv();
                }
                let _ = seen_tx.send(f.sequence);
            }))
            .await
            .map_err(|(e, _)| e)
            .unwrap();

        // Frame 0 must be in the callback before the backlog builds up
        sender.push(device_frame(4096, 16_000, 1, 0.1));
        tokio::time::timeout(Duration::from_secs(2), blocked_rx.recv())
            .await
            .expect("first frame never reached the callback");

        for _ in 1..8 {
            sender.push(device_frame(4096, 16_000, 1, 0.1));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        release_tx.send(()).unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(seq)) = tokio::time::timeout(Duration::from_millis(300), seen_rx.recv()).await {
            seen.push(seq);
        }

        assert_eq!(seen.first(), Some(&0));
        assert!(seen.len() < 8, "some frames should have been dropped: {:?}", seen);
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "order preserved: {:?}", seen);
        assert_eq!(seen.last(), Some(&7), "newest frame survives");
        assert!(pipeline.dropped_frames() > 0);

        pipeline.stop().await;
    }
}
