use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{AudioFrame, AudioInput};
use crate::error::CaptureError;

/// A fully decoded audio file (any format symphonia can read)
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples in [-1, 1]
    pub samples: Vec<f32>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open audio file: {}", path.display()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .context("Unrecognized audio format")?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| anyhow!("No decodable audio track"))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let mut decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .context("Unsupported codec")?;

        let mut sample_rate = params.sample_rate.unwrap_or(0);
        let mut channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);
        let mut samples = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => return Err(e).context("Failed to read packet"),
            };
            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    sample_rate = spec.rate;
                    channels = spec.channels.count() as u16;
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping undecodable packet: {}", e);
                }
                Err(e) => return Err(e).context("Decoder failed"),
            }
        }

        if sample_rate == 0 || channels == 0 {
            anyhow::bail!("Audio file has no sample rate or channel layout");
        }

        let duration_seconds = samples.len() as f64 / (sample_rate as f64 * channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            sample_rate,
            channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate,
            channels,
            samples,
        })
    }
}

/// Input device that replays an audio file in real time.
///
/// Useful for headless runs and demos: the file stands in for a microphone,
/// delivered in `buffer_duration_ms` buffers at wall-clock pace.
pub struct FileInput {
    path: String,
    buffer_duration_ms: u64,
    looped: bool,
    task: Option<JoinHandle<()>>,
}

impl FileInput {
    pub fn new(path: impl Into<String>, buffer_duration_ms: u64) -> Self {
        Self {
            path: path.into(),
            buffer_duration_ms: buffer_duration_ms.max(1),
            looped: false,
            task: None,
        }
    }

    pub fn looped(mut self, looped: bool) -> Self {
        self.looped = looped;
        self
    }
}

#[async_trait::async_trait]
impl AudioInput for FileInput {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::AlreadyActive);
        }

        let path = self.path.clone();
        let audio = tokio::task::spawn_blocking(move || AudioFile::open(&path))
            .await
            .map_err(|e| CaptureError::Device(e.to_string()))?
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{:#}", e)))?;

        let channels = audio.channels as usize;
        let per_buffer =
            (audio.sample_rate as u64 * self.buffer_duration_ms / 1000).max(1) as usize * channels;
        let buffer_duration = Duration::from_millis(self.buffer_duration_ms);
        let looped = self.looped;

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(buffer_duration);
            let mut timestamp_ms = 0u64;
            loop {
                for block in audio.samples.chunks(per_buffer) {
                    ticker.tick().await;
                    let frame = AudioFrame {
                        samples: block.to_vec(),
                        sample_rate: audio.sample_rate,
                        channels: audio.channels,
                        timestamp_ms,
                    };
                    timestamp_ms += frame.duration_ms() as u64;
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                if !looped || audio.samples.is_empty() {
                    debug!("File input reached end of {}", audio.path);
                    return;
                }
            }
        });

        self.task = Some(task);
        info!("File input started: {}", self.path);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            info!("File input stopped: {}", self.path);
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    fn name(&self) -> &str {
        "file"
    }
}
