use serde::Deserialize;
use std::time::Duration;

use crate::audio::{pcm, AudioBackendConfig, CAPTURE_FRAME_SAMPLES};
use crate::error::ConfigError;
use crate::playback::{LevelMode, PlayerConfig, PLAYBACK_GAIN};
use crate::session::{LanguageCode, SessionConfig};
use crate::transport::ReconnectPolicy;

/// Prefix for environment overrides, e.g. `LOQA_VOICE__BACKEND__URL`
pub const ENV_PREFIX: &str = "LOQA_VOICE";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub backend: BackendConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "loqa-voice".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 3030,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub user_id: Option<String>,
    pub connect_timeout_secs: u64,
    pub language: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user_id: None,
            connect_timeout_secs: 30,
            language: crate::session::DEFAULT_LANGUAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub buffer_duration_ms: u64,
    pub max_pending_frames: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: pcm::CAPTURE_SAMPLE_RATE,
            frame_samples: CAPTURE_FRAME_SAMPLES,
            buffer_duration_ms: 100,
            max_pending_frames: 4,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub jitter_window_ms: u64,
    pub level_mode: LevelMode,
    pub gain: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: pcm::PLAYBACK_SAMPLE_RATE,
            jitter_window_ms: 150,
            level_mode: LevelMode::default(),
            gain: PLAYBACK_GAIN,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 retries forever
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl Config {
    /// Load `path` (any format the `config` crate knows, extension optional)
    /// with `LOQA_VOICE__SECTION__KEY` environment overrides on top.
    /// A missing file falls back to defaults.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Build the session configuration. Fails when no backend URL is set.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let language: LanguageCode = self.backend.language.parse()?;

        let config = SessionConfig {
            backend_url: self.backend.url.clone(),
            user_id: self
                .backend
                .user_id
                .clone()
                .or_else(|| SessionConfig::default().user_id),
            connect_timeout: Duration::from_secs(self.backend.connect_timeout_secs),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                max_attempts: (self.reconnect.max_attempts > 0).then_some(self.reconnect.max_attempts),
            },
            capture: AudioBackendConfig {
                target_sample_rate: self.audio.sample_rate,
                frame_samples: self.audio.frame_samples,
                buffer_duration_ms: self.audio.buffer_duration_ms,
                max_pending_frames: self.audio.max_pending_frames,
                echo_cancellation: self.audio.echo_cancellation,
                noise_suppression: self.audio.noise_suppression,
                auto_gain_control: self.audio.auto_gain_control,
            },
            player: PlayerConfig {
                jitter_window: Duration::from_millis(self.playback.jitter_window_ms),
                sample_rate: self.playback.sample_rate,
                level_mode: self.playback.level_mode,
                gain: self.playback.gain,
                ..PlayerConfig::default()
            },
            language,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = Config::load("/nonexistent/loqa-voice").unwrap();
        assert_eq!(cfg.service.http.port, 3030);
        assert_eq!(cfg.playback.jitter_window_ms, 150);
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.playback.gain, 1.5);
        assert!(matches!(cfg.session_config(), Err(ConfigError::MissingBackendUrl)));
    }

    #[test]
    fn loads_toml_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[backend]
url = "ws://localhost:9000/voice"
language = "hi-IN"

[playback]
jitter_window_ms = 80
level_mode = "rms"
gain = 1.0

[reconnect]
base_delay_ms = 100
max_attempts = 0
"#
        )
        .unwrap();

        let cfg = Config::load(file.path().to_str().unwrap()).unwrap();
        let session = cfg.session_config().unwrap();
        assert_eq!(session.backend_url, "ws://localhost:9000/voice");
        assert_eq!(session.language.as_str(), "hi-IN");
        assert_eq!(session.player.jitter_window, Duration::from_millis(80));
        assert_eq!(session.player.level_mode, LevelMode::Rms);
        assert_eq!(session.player.gain, 1.0);
        assert_eq!(session.reconnect.base_delay, Duration::from_millis(100));
        assert_eq!(session.reconnect.max_attempts, None);
        assert_eq!(session.capture.frame_samples, 4096);
    }

    #[test]
    fn rejects_unsupported_language() {
        let mut cfg = Config::default();
        cfg.backend.url = "ws://localhost:9000".to_string();
        cfg.backend.language = "tlh".to_string();
        assert!(matches!(
            cfg.session_config(),
            Err(ConfigError::UnsupportedLanguage(_))
        ));
    }
}
