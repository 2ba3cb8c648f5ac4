//! Microphone enumeration using ALSA

use alsa::pcm::HwParams;
use alsa::{Direction, PCM};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;

/// Rates tried when listing devices
const PROBE_RATES: [u32; 5] = [8000, 16000, 24000, 44100, 48000];

/// Microphone information
#[derive(Debug, Clone, Serialize)]
pub struct MicrophoneInfo {
    /// ALSA device name (e.g., "hw:1,0" or "default")
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Sample rates the device accepts
    pub sample_rates: Vec<u32>,
    /// Whether the device can capture mono directly
    pub supports_mono: bool,
}

impl MicrophoneInfo {
    /// Whether the device can run at `rate` without the plug layer resampling
    pub fn supports_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }
}

/// Enumerate capture-capable ALSA devices
///
/// Devices that are busy or cannot be opened for capture are skipped. The
/// "default" device is listed first when it can be opened.
pub fn enumerate_microphones() -> Result<Vec<MicrophoneInfo>> {
    let mut devices = Vec::new();

    for card_result in alsa::card::Iter::new() {
        let card = match card_result {
            Ok(c) => c,
            Err(e) => {
                debug!("Error iterating card: {}", e);
                continue;
            }
        };

        let card_index = card.get_index();
        let card_name = card
            .get_longname()
            .or_else(|_| card.get_name())
            .unwrap_or_else(|_| "Unknown".to_string());

        for device_index in 0..8 {
            let name = format!("hw:{},{}", card_index, device_index);
            let Ok(pcm) = PCM::new(&name, Direction::Capture, false) else {
                continue;
            };

            if let Some(info) = inspect_device(&pcm, &name, format!("{} - Device {}", card_name, device_index)) {
                debug!("Found microphone {}: {}", info.name, info.description);
                devices.push(info);
            }
        }
    }

    if let Ok(pcm) = PCM::new("default", Direction::Capture, false) {
        if let Some(info) = inspect_device(&pcm, "default", "Default Audio Device".to_string()) {
            devices.insert(0, info);
        }
    }

    info!("Found {} microphones", devices.len());
    Ok(devices)
}

fn inspect_device(pcm: &PCM, name: &str, description: String) -> Option<MicrophoneInfo> {
    let hwp = HwParams::any(pcm).ok()?;

    let sample_rates: Vec<u32> = PROBE_RATES
        .iter()
        .copied()
        .filter(|rate| hwp.test_rate(*rate).is_ok())
        .collect();
    if sample_rates.is_empty() {
        return None;
    }

    Some(MicrophoneInfo {
        name: name.to_string(),
        description,
        sample_rates,
        supports_mono: hwp.test_channels(1).is_ok(),
    })
}
