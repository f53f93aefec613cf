//! Voice session management
//!
//! This module provides the `SessionController` that manages:
//! - The backend connection, its handshake and reconnect schedule
//! - Microphone capture while an interaction is active
//! - Routing received speech to the player
//! - Transcript collection and the observables shown to the user

mod config;
mod controller;
mod location;
mod state;
mod transcript;

pub use config::SessionConfig;
pub use controller::{SessionController, SessionDiagnostics, SessionObservers};
pub use location::{LanguageCode, LocationSummary, DEFAULT_LANGUAGE, SUPPORTED_LANGUAGES};
pub use state::{SessionState, SessionStatus, StateTransition};
pub use transcript::{SpeakingFlags, TranscriptLog, TranscriptUpdate, Utterance};
