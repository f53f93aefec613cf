//! System audio devices: microphone capture through cpal, speaker playback
//! through rodio
//!
//! Neither cpal input streams nor rodio output streams may move between
//! threads, so each is owned by a dedicated thread for as long as it is open.

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::backend::{AudioFrame, AudioInput};
use super::output::{AudioOutput, PlaybackUnit};
use crate::error::CaptureError;

/// Device buffers queued for the capture pipeline before new ones are dropped
const DEVICE_QUEUE_FRAMES: usize = 32;

/// Microphone input on the default (or a named) cpal input device.
///
/// A missing device or a refused permission surfaces as
/// [`CaptureError::DeviceUnavailable`] from `start`.
pub struct MicrophoneInput {
    device_name: Option<String>,
    worker: Option<(std::sync::mpsc::Sender<()>, JoinHandle<()>)>,
}

impl MicrophoneInput {
    /// `device_name` selects an input by name; `None` uses the host default.
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            worker: None,
        }
    }

    /// Names of the input devices the host reports.
    pub fn list_devices() -> Result<Vec<String>, CaptureError> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

fn find_input_device(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".to_string())),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("input device '{}' not found", wanted))),
    }
}

fn open_stream(
    device_name: Option<&str>,
    tx: mpsc::Sender<AudioFrame>,
) -> Result<(cpal::Stream, String), CaptureError> {
    let device = find_input_device(device_name)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    // Permission problems show up here or when building the stream
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", name, e)))?;
    let config: cpal::StreamConfig = supported.config();
    debug!("Input device {} config: {:?}", name, supported);

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, tx),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, tx),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, tx),
        other => {
            return Err(CaptureError::Device(format!(
                "unsupported sample format {:?} on {}",
                other, name
            )))
        }
    }
    .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", name, e)))?;

    stream
        .play()
        .map_err(|e| CaptureError::Device(format!("{}: {}", name, e)))?;
    Ok((stream, name))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;
    let mut captured: u64 = 0;

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let frame = AudioFrame {
                samples: data.iter().map(|&s| s.to_sample::<f32>()).collect(),
                sample_rate,
                channels,
                timestamp_ms: captured * 1000 / sample_rate.max(1) as u64,
            };
            captured += (data.len() / channels.max(1) as usize) as u64;
            // Realtime callback: never block
            let _ = tx.try_send(frame);
        },
        |err| warn!("Input stream error: {}", err),
        None,
    )
}

#[async_trait::async_trait]
impl AudioInput for MicrophoneInput {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyActive);
        }

        let (tx, rx) = mpsc::channel(DEVICE_QUEUE_FRAMES);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("loqa-microphone".to_string())
            .spawn(move || {
                let stream = match open_stream(device_name.as_deref(), tx) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Until stop() or the input is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::Device(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(name)) => {
                info!("Microphone capture started on {}", name);
                self.worker = Some((stop_tx, thread));
                Ok(rx)
            }
            Ok(Err(e)) => {
                warn!("Microphone unavailable: {}", e);
                Err(e)
            }
            Err(_) => Err(CaptureError::Device("capture thread exited".to_string())),
        }
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        let Some((stop_tx, thread)) = self.worker.take() else {
            return Ok(());
        };
        let _ = stop_tx.send(());
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| CaptureError::Device(e.to_string()))?
            .map_err(|_| CaptureError::Device("capture thread panicked".to_string()))?;
        info!("Microphone capture stopped");
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }

    fn name(&self) -> &str {
        "microphone"
    }
}

/// Playback on the default output device.
///
/// Every unit gets its own sink so a halted unit never affects the next one.
pub struct SpeakerOutput {
    handle: rodio::OutputStreamHandle,
    current: Mutex<Option<Arc<rodio::Sink>>>,
    // Keeps the stream thread alive; dropping it closes the device
    _shutdown: std::sync::mpsc::Sender<()>,
}

impl SpeakerOutput {
    pub fn open() -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("loqa-speaker".to_string())
            .spawn(move || match rodio::OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(anyhow!("no output device: {}", e)));
                }
            })
            .context("Failed to spawn speaker thread")?;

        let handle = ready_rx.recv().context("Speaker thread exited")??;
        info!("Speaker output opened on the default device");

        Ok(Self {
            handle,
            current: Mutex::new(None),
            _shutdown: shutdown_tx,
        })
    }

    fn set_current(&self, sink: Option<Arc<rodio::Sink>>) -> Option<Arc<rodio::Sink>> {
        match self.current.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, sink),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), sink),
        }
    }
}

#[async_trait::async_trait]
impl AudioOutput for SpeakerOutput {
    async fn play(&self, unit: &PlaybackUnit) -> Result<()> {
        let sink = Arc::new(
            rodio::Sink::try_new(&self.handle).map_err(|e| anyhow!("cannot open output sink: {}", e))?,
        );
        sink.append(rodio::buffer::SamplesBuffer::new(
            1,
            unit.sample_rate,
            unit.samples.clone(),
        ));
        self.set_current(Some(Arc::clone(&sink)));

        let waiting = Arc::clone(&sink);
        tokio::task::spawn_blocking(move || waiting.sleep_until_end())
            .await
            .context("Speaker playback wait failed")?;
        Ok(())
    }

    fn halt(&self) {
        if let Some(sink) = self.set_current(None) {
            sink.stop();
        }
    }

    fn name(&self) -> &str {
        "speaker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_microphone_is_unavailable() {
        let mut input = MicrophoneInput::new(Some("loqa-no-such-device".to_string()));
        let result = input.start().await;
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
        assert!(!input.is_capturing());
        // Nothing to release
        input.stop().await.unwrap();
    }
}
