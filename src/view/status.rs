//! Status projection for the presentation layer

use serde::Serialize;

use crate::audio::RecordingState;
use crate::session::ConnectionState;

/// What the UI shows for the avatar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarStatus {
    /// Session setup in progress
    Initializing,
    /// Session failed or disconnected; recording control disabled
    Unavailable,
    /// Connected, not recording
    Ready,
    /// Connected and streaming microphone audio
    Recording,
}

impl AvatarStatus {
    /// Derive the display status from the two source states
    pub fn project(connection: ConnectionState, recording: RecordingState) -> Self {
        match (connection, recording) {
            (ConnectionState::Uninitialized | ConnectionState::Initializing, _) => {
                AvatarStatus::Initializing
            }
            (ConnectionState::Disconnected | ConnectionState::Failed, _) => {
                AvatarStatus::Unavailable
            }
            (ConnectionState::Connected, RecordingState::Recording) => AvatarStatus::Recording,
            (ConnectionState::Connected, RecordingState::Idle) => AvatarStatus::Ready,
        }
    }

    /// Whether the recording toggle does anything
    pub fn can_record(&self) -> bool {
        matches!(self, AvatarStatus::Ready | AvatarStatus::Recording)
    }
}

impl std::fmt::Display for AvatarStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AvatarStatus::Initializing => write!(f, "initializing"),
            AvatarStatus::Unavailable => write!(f, "unavailable"),
            AvatarStatus::Ready => write!(f, "ready"),
            AvatarStatus::Recording => write!(f, "recording"),
        }
    }
}

/// Snapshot rendered by the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub status: AvatarStatus,
    pub connection: ConnectionState,
    pub recording: RecordingState,
    /// Human-readable status line
    pub message: String,
    /// Last microphone error, if the last start failed
    pub mic_error: Option<String>,
}

impl StatusView {
    pub fn new(
        connection: ConnectionState,
        recording: RecordingState,
        reason: Option<&str>,
        mic_error: Option<String>,
    ) -> Self {
        let status = AvatarStatus::project(connection, recording);
        let message = match (connection, status) {
            (ConnectionState::Failed, _) => match reason {
                Some(reason) => format!("Avatar unavailable: {}", reason),
                None => "Avatar unavailable".to_string(),
            },
            (ConnectionState::Disconnected, _) => match reason {
                Some(reason) => format!("Avatar disconnected: {}", reason),
                None => "Avatar disconnected".to_string(),
            },
            (_, AvatarStatus::Initializing) => "Connecting to avatar...".to_string(),
            (_, AvatarStatus::Recording) => "Listening".to_string(),
            _ => "Ready".to_string(),
        };

        Self {
            status,
            connection,
            recording,
            message,
            mic_error,
        }
    }
}
