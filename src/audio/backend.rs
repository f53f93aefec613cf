use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::CaptureError;

use super::file::FileInput;
use super::pcm::CAPTURE_SAMPLE_RATE;

/// Samples per frame handed to the encoder (256 ms at 16kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

/// Audio sample data as delivered by an input device
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Normalized samples in [-1, 1], interleaved
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self) -> f64 {
        let per_channel = self.samples.len() as f64 / self.channels.max(1) as f64;
        per_channel * 1000.0 / self.sample_rate.max(1) as f64
    }
}

/// Configuration for audio capture
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Rate frames are resampled to before encoding
    pub target_sample_rate: u32,
    /// Samples per encoded frame
    pub frame_samples: usize,
    /// Device buffer size in milliseconds (affects latency)
    pub buffer_duration_ms: u64,
    /// Frames allowed to wait for the consumer before the oldest is dropped
    pub max_pending_frames: usize,
    /// Processing hints forwarded to devices that support them
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: CAPTURE_SAMPLE_RATE,
            frame_samples: CAPTURE_FRAME_SAMPLES,
            buffer_duration_ms: 100,
            max_pending_frames: 4,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Audio input device trait
///
/// Implementations:
/// - Microphone: system input device through cpal (`device` feature)
/// - File: decode an audio file and replay it in real time
/// - Channel: frames pushed by the embedding application (tests, custom glue)
#[async_trait::async_trait]
pub trait AudioInput: Send + Sync {
    /// Acquire the device and start capturing
    ///
    /// Returns a channel receiver that will receive audio frames
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError>;

    /// Release the device. Calling this while not capturing is a no-op.
    async fn stop(&mut self) -> Result<(), CaptureError>;

    /// Check if the device is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get device name for logging
    fn name(&self) -> &str;
}

/// Audio input source selection
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Replay an audio file as if it were a microphone
    File { path: String, looped: bool },
    /// Frames pushed through a [`ChannelInputSender`]
    Channel,
    /// System microphone; `None` picks the default input
    #[cfg(feature = "device")]
    Microphone { device: Option<String> },
}

/// Audio input factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    /// Create an input device for the given source.
    ///
    /// For [`AudioSource::Channel`] the returned sender feeds the device.
    pub fn create(
        source: AudioSource,
        config: &AudioBackendConfig,
    ) -> (Box<dyn AudioInput>, Option<ChannelInputSender>) {
        match source {
            AudioSource::File { path, looped } => {
                let input = FileInput::new(path, config.buffer_duration_ms).looped(looped);
                (Box::new(input), None)
            }
            AudioSource::Channel => {
                let (input, sender) = ChannelInput::new();
                (Box::new(input), Some(sender))
            }
            #[cfg(feature = "device")]
            AudioSource::Microphone { device } => {
                if config.echo_cancellation || config.noise_suppression || config.auto_gain_control {
                    debug!("Microphone input ignores echo cancellation, noise suppression and gain hints");
                }
                (Box::new(super::device::MicrophoneInput::new(device)), None)
            }
        }
    }
}

/// Handle used to push frames into a [`ChannelInput`].
#[derive(Clone)]
pub struct ChannelInputSender {
    tx: mpsc::UnboundedSender<AudioFrame>,
}

impl ChannelInputSender {
    /// Push a frame; returns false once the input has been dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Input device fed by an external producer.
///
/// Frames pushed while the device is stopped are discarded; the device only
/// forwards while started, the same way a muted microphone drops samples.
pub struct ChannelInput {
    source: Option<mpsc::UnboundedReceiver<AudioFrame>>,
    forwarder: Option<tokio::task::JoinHandle<mpsc::UnboundedReceiver<AudioFrame>>>,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ChannelInput {
    pub fn new() -> (Self, ChannelInputSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                source: Some(rx),
                forwarder: None,
                stop_tx: None,
            },
            ChannelInputSender { tx },
        )
    }
}

#[async_trait::async_trait]
impl AudioInput for ChannelInput {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if self.forwarder.is_some() {
            return Err(CaptureError::AlreadyActive);
        }
        let mut source = self
            .source
            .take()
            .ok_or_else(|| CaptureError::DeviceUnavailable("channel input was closed".into()))?;

        // Drop anything that queued up while stopped.
        while source.try_recv().is_ok() {}

        let (tx, rx) = mpsc::channel(32);
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    frame = source.recv() => match frame {
                        Some(frame) => {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            debug!("Channel input producer went away");
                            break;
                        }
                    }
                }
            }
            source
        });

        self.forwarder = Some(forwarder);
        self.stop_tx = Some(stop_tx);
        info!("Channel input started");
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        let Some(forwarder) = self.forwarder.take() else {
            return Ok(());
        };
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let source = forwarder
            .await
            .map_err(|e| CaptureError::Device(format!("channel forwarder failed: {}", e)))?;
        self.source = Some(source);
        info!("Channel input stopped");
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.forwarder.is_some()
    }

    fn name(&self) -> &str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: usize) -> AudioFrame {
        AudioFrame {
            samples: vec![0.1; n],
            sample_rate: 16_000,
            channels: 1,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_frame_duration() {
        let stereo = AudioFrame {
            samples: vec![0.0; 9600],
            sample_rate: 48_000,
            channels: 2,
            timestamp_ms: 0,
        };
        assert!((stereo.duration_ms() - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_channel_input_forwards_while_started() {
        let (mut input, sender) = ChannelInput::new();
        let mut rx = input.start().await.unwrap();
        assert!(input.is_capturing());

        assert!(sender.push(frame(160)));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.samples.len(), 160);

        input.stop().await.unwrap();
        assert!(!input.is_capturing());
        // Stop is idempotent
        input.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_input_rejects_double_start() {
        let (mut input, _sender) = ChannelInput::new();
        let _rx = input.start().await.unwrap();
        assert!(matches!(input.start().await, Err(CaptureError::AlreadyActive)));
        input.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_input_restarts_after_stop() {
        let (mut input, sender) = ChannelInput::new();
        let _ = input.start().await.unwrap();
        input.stop().await.unwrap();

        sender.push(frame(10)); // discarded while stopped
        let mut rx = input.start().await.unwrap();
        sender.push(frame(20));
        assert_eq!(rx.recv().await.unwrap().samples.len(), 20);
        input.stop().await.unwrap();
    }
}
