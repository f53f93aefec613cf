//! Linear PCM codec
//!
//! Conversions between normalized `f32` samples and signed 16-bit
//! little-endian PCM, plus the resampling and downmixing needed to bring
//! device audio to the fixed wire rates.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::DecodeError;

/// Sample rate of audio sent to the backend.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized speech received from the backend.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// MIME tag attached to every outbound media chunk.
pub const PCM_MIME_TYPE: &str = "audio/pcm";

/// Downmix, resample and quantize a block of samples to int16 LE bytes.
///
/// `samples` are interleaved with `channels` channels at `source_rate`.
pub fn encode_frame(samples: &[f32], channels: u16, source_rate: u32, target_rate: u32) -> Vec<u8> {
    let mono = downmix_to_mono(samples, channels);
    let resampled = resample(&mono, source_rate, target_rate);
    samples_to_bytes(&resampled)
}

/// Quantize mono samples without resampling.
pub fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| quantize(s).to_le_bytes())
        .collect()
}

/// Inverse of [`samples_to_bytes`]: `int16 / 32768`.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// One normalized sample as int16, `round(x * 32767)` after clamping.
pub fn quantize(sample: f32) -> i16 {
    // NaN clamps to NaN and casts to 0; `as` saturates at the i16 bounds.
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Average interleaved channels into a single channel.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// One-shot linear resampling.
///
/// The output holds `round(len * to / from)` samples, so total duration is
/// preserved to within one sample.
pub fn resample(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || input.is_empty() || from == 0 || to == 0 {
        return input.to_vec();
    }
    let out_len = ((input.len() as u64 * to as u64 + from as u64 / 2) / from as u64) as usize;
    let step = from as f64 / to as f64;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = input[idx];
            let b = input[(idx + 1).min(last)];
            a + (b - a) * frac.clamp(0.0, 1.0)
        })
        .collect()
}

/// Streaming linear resampler that keeps its phase across buffers.
///
/// Device callbacks deliver arbitrary buffer sizes; resampling each one in
/// isolation would round every buffer and drift. This keeps the fractional
/// read position and the previous buffer's last sample instead.
#[derive(Debug, Clone)]
pub struct Resampler {
    from: u32,
    to: u32,
    step: f64,
    pos: f64,
    prev: Option<f32>,
}

impl Resampler {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            from,
            to,
            step: from as f64 / to.max(1) as f64,
            pos: 0.0,
            prev: None,
        }
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.from == self.to || self.from == 0 || self.to == 0 {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let offset = usize::from(self.prev.is_some());
        let len = input.len() + offset;
        let prev = self.prev;
        let at = |i: usize| -> f32 {
            match prev {
                Some(p) if i == 0 => p,
                Some(_) => input[i - 1],
                None => input[i],
            }
        };

        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        while (self.pos.floor() as usize) + 1 < len {
            let idx = self.pos.floor() as usize;
            let frac = (self.pos - idx as f64) as f32;
            let a = at(idx);
            let b = at(idx + 1);
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        // The last sample becomes index 0 of the next call.
        self.pos -= (len - 1) as f64;
        self.prev = input.last().copied();
        out
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.prev = None;
    }
}

/// Root-mean-square amplitude scaled to `[0, 100]`.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    (rms * 100.0).clamp(0.0, 100.0)
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_base64(payload: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(payload)?)
}
