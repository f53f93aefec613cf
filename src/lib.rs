pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod playback;
pub mod session;
pub mod transport;

pub use audio::{
    AudioBackendConfig, AudioBackendFactory, AudioFile, AudioFrame, AudioInput, AudioOutput,
    AudioSource, CapturePipeline, ChannelInputSender, NullOutput, PlaybackUnit, WavOutput,
};
pub use config::Config;
pub use error::{CaptureError, ConfigError, DecodeError, SessionError, TransportError};
pub use http::{create_router, AppState};
pub use playback::{PlaybackChunk, Player, PlayerConfig, PlayerEvent};
pub use session::{
    LanguageCode, LocationSummary, SessionConfig, SessionController, SessionObservers,
    SessionState, SessionStatus,
};
pub use transport::{ClientMessage, ServerMessage};
