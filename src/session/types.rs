//! Connection state machine

use serde::{Deserialize, Serialize};

/// Connection state of the avatar session
///
/// `Uninitialized -> Initializing -> {Connected | Failed}`, then
/// `Connected -> Disconnected`. `Failed` and `Disconnected` are terminal for
/// the mount; retrying needs a fresh mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Initializing,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// No transition leaves this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Notification from the session transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Failed { reason: String },
    Disconnected { reason: String },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connected => "connected",
            SessionEvent::Failed { .. } => "failed",
            SessionEvent::Disconnected { .. } => "disconnected",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SessionEvent::Connected => None,
            SessionEvent::Failed { reason } | SessionEvent::Disconnected { reason } => {
                Some(reason)
            }
        }
    }
}

/// Next state after `event` arrives in `state`, or `None` if it is ignored
///
/// A disconnect before the session ever connected is a setup failure; a
/// failure after it connected is a disconnect.
pub fn transition(state: ConnectionState, event: &SessionEvent) -> Option<ConnectionState> {
    use ConnectionState::*;

    match (state, event) {
        (Initializing, SessionEvent::Connected) => Some(Connected),
        (Initializing, SessionEvent::Failed { .. })
        | (Initializing, SessionEvent::Disconnected { .. }) => Some(Failed),
        (Connected, SessionEvent::Disconnected { .. })
        | (Connected, SessionEvent::Failed { .. }) => Some(Disconnected),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> SessionEvent {
        SessionEvent::Failed {
            reason: "boom".to_string(),
        }
    }

    fn disconnected() -> SessionEvent {
        SessionEvent::Disconnected {
            reason: "remote closed".to_string(),
        }
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;

        assert_eq!(transition(Initializing, &SessionEvent::Connected), Some(Connected));
        assert_eq!(transition(Initializing, &failed()), Some(Failed));
        assert_eq!(transition(Initializing, &disconnected()), Some(Failed));
        assert_eq!(transition(Connected, &disconnected()), Some(Disconnected));
        assert_eq!(transition(Connected, &failed()), Some(Disconnected));
        assert_eq!(transition(Connected, &SessionEvent::Connected), None);
        assert_eq!(transition(Uninitialized, &SessionEvent::Connected), None);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        for state in [ConnectionState::Failed, ConnectionState::Disconnected] {
            assert!(state.is_terminal());
            for event in [SessionEvent::Connected, failed(), disconnected()] {
                assert_eq!(transition(state, &event), None);
            }
        }
    }

    #[test]
    fn test_event_reason() {
        assert_eq!(SessionEvent::Connected.reason(), None);
        assert_eq!(disconnected().reason(), Some("remote closed"));
        assert_eq!(failed().name(), "failed");
    }
}
