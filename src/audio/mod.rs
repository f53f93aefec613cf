pub mod backend;
pub mod capture;
#[cfg(feature = "device")]
pub mod device;
pub mod file;
pub mod output;
pub mod pcm;

pub use backend::{
    AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioInput, AudioSource, ChannelInput,
    ChannelInputSender, CAPTURE_FRAME_SAMPLES,
};
pub use capture::{CapturePipeline, CapturedFrame, FrameCallback};
#[cfg(feature = "device")]
pub use device::{MicrophoneInput, SpeakerOutput};
pub use file::{AudioFile, FileInput};
pub use output::{AudioOutput, NullOutput, PlaybackUnit, WavOutput};
