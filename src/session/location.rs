use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Where the user is, as forwarded with `start_interaction`
///
/// When deserialized without `formattedForAI`, the description is built
/// from the place names that are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "LocationFields")]
pub struct LocationSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Single line description handed to the agent
    #[serde(rename = "formattedForAI")]
    pub formatted_for_ai: String,
}

#[derive(Deserialize)]
struct LocationFields {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default, rename = "formattedForAI")]
    formatted_for_ai: Option<String>,
}

impl From<LocationFields> for LocationSummary {
    fn from(fields: LocationFields) -> Self {
        match fields.formatted_for_ai.filter(|f| !f.trim().is_empty()) {
            Some(formatted_for_ai) => Self {
                city: fields.city,
                state: fields.state,
                country: fields.country,
                formatted_for_ai,
            },
            None => Self::from_place(fields.city, fields.state, fields.country),
        }
    }
}

impl LocationSummary {
    /// Build from place names, joining the known parts.
    pub fn from_place(city: Option<String>, state: Option<String>, country: Option<String>) -> Self {
        let parts: Vec<&str> = [&city, &state, &country]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .filter(|p| !p.trim().is_empty())
            .collect();
        let formatted_for_ai = if parts.is_empty() {
            "Unknown location".to_string()
        } else {
            parts.join(", ")
        };
        Self {
            city,
            state,
            country,
            formatted_for_ai,
        }
    }

    /// Fallback when only a position fix is available.
    pub fn from_coordinates(latitude: f64, longitude: f64) -> Self {
        Self {
            city: None,
            state: None,
            country: None,
            formatted_for_ai: format!("coordinates {:.4}, {:.4}", latitude, longitude),
        }
    }

    /// Free-form description, e.g. from the command line.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            city: None,
            state: None,
            country: None,
            formatted_for_ai: text.into(),
        }
    }
}

/// Language codes the backend accepts.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "en-US", "en-GB", "en-AU", "en-IN", "es-ES", "es-US", "fr-FR", "fr-CA", "de-DE", "it-IT",
    "pt-BR", "ja-JP", "ko-KR", "cmn-CN", "hi-IN", "ar-XA", "ru-RU", "vi-VN", "th-TH", "tr-TR",
    "nl-NL", "pl-PL", "id-ID", "bn-IN", "gu-IN", "kn-IN", "ml-IN", "mr-IN", "ta-IN", "te-IN",
];

pub const DEFAULT_LANGUAGE: &str = "en-US";

/// BCP-47 tag from [`SUPPORTED_LANGUAGES`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LanguageCode {
    fn default() -> Self {
        Self(DEFAULT_LANGUAGE.to_string())
    }
}

impl FromStr for LanguageCode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        SUPPORTED_LANGUAGES
            .iter()
            .find(|code| code.eq_ignore_ascii_case(s))
            .map(|code| Self(code.to_string()))
            .ok_or_else(|| ConfigError::UnsupportedLanguage(s.to_string()))
    }
}

impl TryFrom<String> for LanguageCode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LanguageCode> for String {
    fn from(code: LanguageCode) -> Self {
        code.0
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
