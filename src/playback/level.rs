use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::pcm;
use crate::audio::PlaybackUnit;

/// How often the playback level is refreshed while a unit plays.
pub const LEVEL_INTERVAL: Duration = Duration::from_millis(200);

/// Band the synthetic level moves in.
pub const SYNTHETIC_LEVEL_MIN: u32 = 20;
pub const SYNTHETIC_LEVEL_MAX: u32 = 40;

/// Source of the playback level shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelMode {
    /// Gentle random movement, enough to animate a speaking indicator
    #[default]
    Synthetic,
    /// RMS of the window currently playing
    Rms,
}

/// Level for a unit that has been playing for `elapsed`.
pub fn playback_level(mode: LevelMode, unit: &PlaybackUnit, elapsed: Duration, window: Duration) -> f32 {
    match mode {
        LevelMode::Synthetic => {
            rand::thread_rng().gen_range(SYNTHETIC_LEVEL_MIN..SYNTHETIC_LEVEL_MAX) as f32
        }
        LevelMode::Rms => {
            let rate = unit.sample_rate as f64;
            let end = ((elapsed.as_secs_f64() * rate) as usize).min(unit.samples.len());
            let start = end.saturating_sub((window.as_secs_f64() * rate) as usize);
            pcm::rms_level(&unit.samples[start..end])
        }
    }
}
