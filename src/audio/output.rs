use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use super::pcm;

/// Slice size used when pacing output in real time
const PACING_SLICE: Duration = Duration::from_millis(20);

/// A coalesced block of agent speech ready for the output device
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: u64,
    /// Mono samples in [-1, 1], envelope already applied
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Size of the PCM payload this unit was built from
    pub byte_len: usize,
    /// Number of received chunks coalesced into this unit
    pub chunk_count: usize,
}

impl PlaybackUnit {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Audio output device trait
///
/// `play` resolves once the unit has finished playing. Dropping the future
/// must stop playback; `halt` flushes anything the device buffered itself.
#[async_trait::async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(&self, unit: &PlaybackUnit) -> Result<()>;

    fn halt(&self) {}

    fn name(&self) -> &str;
}

/// Output that discards samples but takes as long as real playback would
#[derive(Debug, Default)]
pub struct NullOutput;

#[async_trait::async_trait]
impl AudioOutput for NullOutput {
    async fn play(&self, unit: &PlaybackUnit) -> Result<()> {
        tokio::time::sleep(unit.duration()).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Output that appends everything played to a 16-bit mono WAV file
///
/// When paced, samples are written in small slices at wall-clock speed so an
/// interrupted unit only leaves the part that was actually "heard".
pub struct WavOutput {
    path: PathBuf,
    writer: Mutex<Option<hound::WavWriter<BufWriter<File>>>>,
    paced: bool,
}

impl WavOutput {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32, paced: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create output directory")?;
        }

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", path))?;

        info!("WAV output writing to {} ({}Hz, paced={})", path.display(), sample_rate, paced);

        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
            paced,
        })
    }

    fn write(&self, samples: &[f32]) -> Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("WAV writer lock poisoned"))?;
        if let Some(writer) = guard.as_mut() {
            for &sample in samples {
                writer
                    .write_sample(pcm::quantize(sample))
                    .context("Failed to write sample to WAV")?;
            }
        }
        Ok(())
    }

    /// Flush and close the file. Further playback is discarded.
    pub fn finalize(&self) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("WAV writer lock poisoned"))?
            .take();
        if let Some(writer) = writer {
            writer.finalize().context("Failed to finalize WAV file")?;
            info!("WAV output finalized: {}", self.path.display());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AudioOutput for WavOutput {
    async fn play(&self, unit: &PlaybackUnit) -> Result<()> {
        if !self.paced {
            return self.write(&unit.samples);
        }

        let slice_len = (unit.sample_rate as u64 * PACING_SLICE.as_millis() as u64 / 1000).max(1) as usize;
        let mut ticker = tokio::time::interval(PACING_SLICE);
        for slice in unit.samples.chunks(slice_len) {
            ticker.tick().await;
            self.write(slice)?;
        }
        // Let the final slice finish "playing"
        ticker.tick().await;
        Ok(())
    }

    fn name(&self) -> &str {
        "wav"
    }
}

impl Drop for WavOutput {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!("Failed to finalize WAV writer on drop: {}", e);
        }
    }
}
