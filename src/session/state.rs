use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Connection/interaction state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    ConnectedIdle,
    Interacting,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::ConnectedIdle | Self::Interacting)
    }

    /// Whether the controller may move from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connecting | ConnectedIdle | Disconnected) => true,
            (ConnectedIdle, Interacting | Connecting | Disconnected) => true,
            (Interacting, ConnectedIdle | Connecting | Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ConnectedIdle => "connected",
            Self::Interacting => "interacting",
        };
        f.write_str(name)
    }
}

/// A state change, in the order the controller applied it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// What the presentation layer shows about the connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub connected: bool,
    /// Latest user-facing message; stays until replaced
    pub message: Option<String>,
    /// Backend bookkeeping warning, if any was reported
    pub warning: Option<String>,
    pub reconnect_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl SessionStatus {
    pub fn initial() -> Self {
        Self {
            state: SessionState::Disconnected,
            connected: false,
            message: None,
            warning: None,
            reconnect_attempts: 0,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn interacting_only_from_connected_idle() {
        assert!(ConnectedIdle.can_transition_to(Interacting));
        assert!(!Disconnected.can_transition_to(Interacting));
        assert!(!Connecting.can_transition_to(Interacting));
    }

    #[test]
    fn disconnected_only_leaves_through_connecting() {
        for next in [Disconnected, ConnectedIdle, Interacting] {
            assert!(!Disconnected.can_transition_to(next));
        }
        assert!(Disconnected.can_transition_to(Connecting));
    }

    #[test]
    fn display_and_serialize() {
        assert_eq!(ConnectedIdle.to_string(), "connected");
        assert_eq!(serde_json::to_string(&ConnectedIdle).unwrap(), "\"connected_idle\"");
        assert!(Interacting.is_connected());
        assert!(!Connecting.is_connected());
    }
}
