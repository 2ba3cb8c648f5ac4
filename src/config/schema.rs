use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remote avatar session settings
    pub session: SessionConfig,
    /// Microphone capture settings
    pub capture: CaptureConfig,
}

impl AppConfig {
    /// Check that the configuration can start a session
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.capture.validate()
    }
}

/// Avatar session configuration
///
/// These are environment-supplied constants passed to the session on
/// construction; nothing here is negotiated at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket endpoint of the avatar session service
    pub url: String,
    /// Credential key
    pub api_key: String,
    /// Avatar face identifier
    pub face_id: String,
    /// Keep the avatar animating while no speech is received
    pub handle_silence: bool,
    /// Maximum session duration in seconds, 0 for no limit
    pub max_session_length_secs: u64,
    /// Maximum time without outgoing audio before the session ends, in seconds, 0 for no limit
    pub max_idle_time_secs: u64,
    /// Connect attempts made by the transport before reporting failure
    pub max_retry_attempts: u32,
    /// Delay between transport connect attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Time allowed between sending the init message and the server's ready
    pub handshake_timeout_ms: u64,
    /// Delay between render target readiness checks in milliseconds
    pub target_poll_interval_ms: u64,
    /// Readiness checks before setup gives up
    pub target_poll_attempts: u32,
    /// Outgoing audio queue depth, in chunks
    pub audio_queue_frames: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.simli.ai/startAudioToVideoSession".to_string(),
            api_key: String::new(),
            face_id: String::new(),
            handle_silence: true,
            max_session_length_secs: 3600,
            max_idle_time_secs: 600,
            max_retry_attempts: 3,
            retry_delay_ms: 2000,
            handshake_timeout_ms: 10_000,
            target_poll_interval_ms: 100,
            target_poll_attempts: 50,
            audio_queue_frames: 64,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(AppError::Config("session.url is empty".to_string()));
        }
        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(AppError::Config(format!(
                "session.url must be a ws:// or wss:// URL, got {}",
                self.url
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(AppError::Config("session.api_key is empty".to_string()));
        }
        if self.face_id.trim().is_empty() {
            return Err(AppError::Config("session.face_id is empty".to_string()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(AppError::Config(
                "session.handshake_timeout_ms must be positive".to_string(),
            ));
        }
        if self.target_poll_attempts == 0 {
            return Err(AppError::Config(
                "session.target_poll_attempts must be at least 1".to_string(),
            ));
        }
        if self.audio_queue_frames == 0 {
            return Err(AppError::Config(
                "session.audio_queue_frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn target_poll_interval(&self) -> Duration {
        Duration::from_millis(self.target_poll_interval_ms)
    }

    pub fn max_session_length(&self) -> Option<Duration> {
        (self.max_session_length_secs > 0).then(|| Duration::from_secs(self.max_session_length_secs))
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        (self.max_idle_time_secs > 0).then(|| Duration::from_secs(self.max_idle_time_secs))
    }
}

/// Microphone capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// ALSA device name (e.g., "hw:1,0" or "default")
    pub device: String,
    /// Requested sample rate in Hz; chunks are sent at whatever rate the device grants
    pub sample_rate: u32,
    /// Samples delivered per processing callback
    pub block_size: usize,
    /// Channel count (only mono is supported by the session)
    pub channels: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            sample_rate: 16000,
            block_size: 4096,
            channels: 1,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(AppError::Config(
                "capture.block_size must be greater than 0".to_string(),
            ));
        }
        if self.channels != 1 {
            return Err(AppError::Config(format!(
                "capture.channels must be 1 (mono), got {}",
                self.channels
            )));
        }
        if self.sample_rate == 0 {
            return Err(AppError::Config(
                "capture.sample_rate must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Duration of one processing block at the configured rate
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate.max(1) as f64)
    }
}
