use std::time::Duration;

use super::location::LanguageCode;
use crate::audio::AudioBackendConfig;
use crate::error::ConfigError;
use crate::playback::PlayerConfig;
use crate::transport::ReconnectPolicy;

/// Everything a [`super::SessionController`] needs to run
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the voice backend
    pub backend_url: String,

    /// Sent in the `setup` handshake
    pub user_id: Option<String>,

    /// Bound on opening the socket and receiving `setup_complete`
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    pub reconnect: ReconnectPolicy,

    pub capture: AudioBackendConfig,

    pub player: PlayerConfig,

    /// Language used when an interaction does not name one
    pub language: LanguageCode,
}

impl SessionConfig {
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_url.trim().is_empty() {
            return Err(ConfigError::MissingBackendUrl);
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend_url: String::new(),
            user_id: Some(format!("user-{}", uuid::Uuid::new_v4())),
            connect_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            capture: AudioBackendConfig::default(),
            player: PlayerConfig::default(),
            language: LanguageCode::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_backend_url_is_rejected() {
        assert!(matches!(
            SessionConfig::default().validate(),
            Err(ConfigError::MissingBackendUrl)
        ));
        assert!(SessionConfig::new("ws://localhost:8080").validate().is_ok());
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::new("ws://localhost:8080");
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert!(config.user_id.unwrap().starts_with("user-"));
    }
}
