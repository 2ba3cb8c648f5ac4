//! Configuration loading: TOML file, then environment overrides

use std::path::Path;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::Result;

pub const ENV_SESSION_URL: &str = "AVATAR_SESSION_URL";
pub const ENV_API_KEY: &str = "AVATAR_API_KEY";
pub const ENV_FACE_ID: &str = "AVATAR_FACE_ID";
pub const ENV_AUDIO_DEVICE: &str = "AVATAR_AUDIO_DEVICE";

/// Load configuration
///
/// A missing file is not an error when no path was given explicitly; the
/// defaults are used instead. Environment variables override file values.
pub async fn load(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = load_file(path).await?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

async fn load_file(path: Option<&Path>) -> Result<AppConfig> {
    let config: AppConfig = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            info!("Loaded configuration from {}", path.display());
            toml::from_str(&text)?
        }
        None => {
            debug!("No configuration file given, using defaults");
            AppConfig::default()
        }
    };
    Ok(config)
}

fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = non_empty(ENV_SESSION_URL) {
        config.session.url = url;
    }
    if let Some(key) = non_empty(ENV_API_KEY) {
        config.session.api_key = key;
    }
    if let Some(face) = non_empty(ENV_FACE_ID) {
        config.session.face_id = face;
    }
    if let Some(device) = non_empty(ENV_AUDIO_DEVICE) {
        config.capture.device = device;
    }
}
