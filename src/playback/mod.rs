//! Streamed speech playback
//!
//! - `player`: the jitter-buffered player actor
//! - `envelope`: edge fades applied to every coalesced unit
//! - `level`: playback level fed to the speaking indicator

pub mod envelope;
pub mod level;
pub mod player;

pub use level::LevelMode;
pub use player::{
    PlaybackChunk, Player, PlayerConfig, PlayerEvent, PlayerStats, PLAYBACK_GAIN,
};
