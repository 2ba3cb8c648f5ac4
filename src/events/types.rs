//! Avatar event types

use serde::{Deserialize, Serialize};

use crate::session::ConnectionState;

/// Avatar event enumeration
///
/// Serialized as `{"event": "<name>", "data": {...}}`:
/// ```json
/// {
///   "event": "session.state_changed",
///   "data": { "state": "connected", "reason": null }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum AvatarEvent {
    /// Connection state of the avatar session changed
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        state: ConnectionState,
        /// Failure or disconnect reason, if any
        reason: Option<String>,
    },

    /// Render targets are not attached yet; setup will retry
    #[serde(rename = "session.waiting_for_targets")]
    WaitingForTargets {
        attempt: u32,
        max_attempts: u32,
    },

    /// Microphone capture started or stopped
    #[serde(rename = "recording.state_changed")]
    RecordingStateChanged { recording: bool },

    /// Microphone could not be opened or the capture graph could not be built
    #[serde(rename = "capture.error")]
    CaptureError {
        /// Error code for programmatic handling
        code: String,
        /// Human-readable message
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AvatarEvent::SessionStateChanged {
            state: ConnectionState::Failed,
            reason: Some("render targets unavailable".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "session.state_changed");
        assert_eq!(json["data"]["state"], "failed");
        assert_eq!(json["data"]["reason"], "render targets unavailable");

        let event = AvatarEvent::RecordingStateChanged { recording: true };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"event":"recording.state_changed","data":{"recording":true}}"#
        );
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"event":"session.waiting_for_targets","data":{"attempt":3,"max_attempts":50}}"#;
        let event: AvatarEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            AvatarEvent::WaitingForTargets {
                attempt: 3,
                max_attempts: 50
            }
        );
    }
}
