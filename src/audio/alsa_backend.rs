//! ALSA capture backend
//!
//! Opening the PCM plays the role of the microphone permission request. The
//! processing node runs the read loop on a capture thread and hands the
//! controller fixed-size `f32` blocks.

use alsa::pcm::{Access, Format, Frames, HwParams, State};
use alsa::{Direction, ValueOr, PCM};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{
    BlockCallback, CaptureBackend, ErrorCallback, MediaTrack, MicrophoneRequest,
    MicrophoneStream, ProcessingContext, ProcessingNode,
};
use crate::error::{AppError, Result};

/// Frames read per ALSA call; keeps the PCM lock short so track stop never waits long
const DEFAULT_PERIOD_FRAMES: u32 = 320;

type SharedPcm = Arc<Mutex<Option<PCM>>>;

/// ALSA capture backend
pub struct AlsaBackend {
    period_frames: u32,
}

impl AlsaBackend {
    pub fn new() -> Self {
        Self {
            period_frames: DEFAULT_PERIOD_FRAMES,
        }
    }

    /// Override the ALSA period size in frames
    pub fn with_period_frames(mut self, period_frames: u32) -> Self {
        self.period_frames = period_frames.max(1);
        self
    }
}

impl Default for AlsaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for AlsaBackend {
    fn name(&self) -> &'static str {
        "alsa"
    }

    async fn request_microphone(
        &self,
        request: &MicrophoneRequest,
    ) -> Result<Box<dyn MicrophoneStream>> {
        let device = request.device.clone();
        let requested_rate = request.sample_rate;
        let request = request.clone();
        let period_frames = self.period_frames;

        let (pcm, sample_rate) =
            tokio::task::spawn_blocking(move || open_pcm(&request, period_frames))
                .await
                .map_err(|e| AppError::Internal(format!("PCM open task failed: {}", e)))??;

        info!(
            "Microphone opened: {} @ {}Hz (requested {}Hz)",
            device, sample_rate, requested_rate
        );

        let pcm: SharedPcm = Arc::new(Mutex::new(Some(pcm)));
        let track = Arc::new(AlsaTrack {
            label: "alsa-capture".to_string(),
            pcm: pcm.clone(),
            live: AtomicBool::new(true),
        });

        Ok(Box::new(AlsaMicrophone {
            pcm,
            track,
            sample_rate,
            period_frames,
        }))
    }

    fn create_context(&self, stream: &dyn MicrophoneStream) -> Result<Box<dyn ProcessingContext>> {
        let mic = stream
            .as_any()
            .downcast_ref::<AlsaMicrophone>()
            .ok_or_else(|| AppError::AudioError("Stream was not opened by ALSA".to_string()))?;

        if !mic.track.is_live() {
            return Err(AppError::AudioError(
                "Microphone track already stopped".to_string(),
            ));
        }

        Ok(Box::new(AlsaContext {
            pcm: mic.pcm.clone(),
            sample_rate: mic.sample_rate,
            period_frames: mic.period_frames,
            closed: false,
            workers: Vec::new(),
        }))
    }
}

/// Open and configure the capture PCM for mono float samples
fn open_pcm(request: &MicrophoneRequest, period_frames: u32) -> Result<(PCM, u32)> {
    let pcm = PCM::new(&request.device, Direction::Capture, false)
        .map_err(|e| map_open_error(&request.device, e))?;

    {
        let hwp = HwParams::any(&pcm)
            .map_err(|e| AppError::AudioError(format!("Failed to get HwParams: {}", e)))?;

        hwp.set_channels(request.channels)
            .map_err(|e| AppError::AudioError(format!("Failed to set channels: {}", e)))?;

        hwp.set_rate(request.sample_rate, ValueOr::Nearest)
            .map_err(|e| AppError::AudioError(format!("Failed to set sample rate: {}", e)))?;

        hwp.set_format(Format::float())
            .map_err(|e| AppError::AudioError(format!("Failed to set format: {}", e)))?;

        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| AppError::AudioError(format!("Failed to set access: {}", e)))?;

        hwp.set_period_size_near(period_frames as Frames, ValueOr::Nearest)
            .map_err(|e| AppError::AudioError(format!("Failed to set period size: {}", e)))?;

        hwp.set_buffer_size_near((period_frames * 8) as Frames)
            .map_err(|e| AppError::AudioError(format!("Failed to set buffer size: {}", e)))?;

        pcm.hw_params(&hwp)
            .map_err(|e| AppError::AudioError(format!("Failed to apply hw params: {}", e)))?;
    }

    let actual_rate = pcm
        .hw_params_current()
        .map(|h| h.get_rate().unwrap_or(request.sample_rate))
        .unwrap_or(request.sample_rate);

    pcm.prepare()
        .map_err(|e| AppError::AudioError(format!("Failed to prepare PCM: {}", e)))?;

    Ok((pcm, actual_rate))
}

fn map_open_error(device: &str, e: alsa::Error) -> AppError {
    let desc = e.to_string();
    if desc.contains("EACCES") || desc.contains("EPERM") || desc.contains("Permission denied") {
        AppError::PermissionDenied(format!("{}: {}", device, desc))
    } else {
        AppError::DeviceUnavailable {
            device: device.to_string(),
            reason: desc,
        }
    }
}

/// Opened capture device
struct AlsaMicrophone {
    pcm: SharedPcm,
    track: Arc<AlsaTrack>,
    sample_rate: u32,
    period_frames: u32,
}

impl MicrophoneStream for AlsaMicrophone {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        vec![self.track.clone()]
    }
}

/// The single mono track of an ALSA capture device
struct AlsaTrack {
    label: String,
    pcm: SharedPcm,
    live: AtomicBool,
}

impl MediaTrack for AlsaTrack {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            // Dropping the PCM closes the device
            if self.pcm.lock().take().is_some() {
                debug!("ALSA capture device closed");
            }
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Processing context: owns the capture workers
struct AlsaContext {
    pcm: SharedPcm,
    sample_rate: u32,
    period_frames: u32,
    closed: bool,
    workers: Vec<(Arc<AtomicBool>, JoinHandle<()>)>,
}

#[async_trait]
impl ProcessingContext for AlsaContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn create_processor(
        &mut self,
        block_size: usize,
        on_block: BlockCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn ProcessingNode>> {
        if self.closed {
            return Err(AppError::AudioError("Processing context is closed".to_string()));
        }
        if block_size == 0 {
            return Err(AppError::AudioError("Block size must be positive".to_string()));
        }
        {
            let guard = self.pcm.lock();
            let pcm = guard
                .as_ref()
                .ok_or_else(|| AppError::AudioError("Capture device was released".to_string()))?;
            pcm.io_f32().map_err(|e| {
                AppError::AudioError(format!("Capture device does not deliver f32 samples: {}", e))
            })?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let pcm = self.pcm.clone();
        let period = self.period_frames as usize;
        let worker_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("alsa-capture".to_string())
            .spawn(move || read_loop(pcm, block_size, period, worker_stop, on_block, on_error))
            .map_err(|e| AppError::AudioError(format!("Failed to spawn capture thread: {}", e)))?;

        self.workers.push((stop.clone(), handle));
        Ok(Box::new(AlsaNode { stop }))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(AppError::AudioError(
                "Processing context already closed".to_string(),
            ));
        }
        self.closed = true;

        let workers = std::mem::take(&mut self.workers);
        for (stop, _) in &workers {
            stop.store(true, Ordering::SeqCst);
        }

        tokio::task::spawn_blocking(move || {
            for (_, handle) in workers {
                if handle.join().is_err() {
                    warn!("ALSA capture thread panicked");
                }
            }
        })
        .await
        .map_err(|e| AppError::Internal(format!("Capture join task failed: {}", e)))?;

        debug!("ALSA processing context closed");
        Ok(())
    }
}

impl Drop for AlsaContext {
    fn drop(&mut self) {
        for (stop, _) in &self.workers {
            stop.store(true, Ordering::SeqCst);
        }
    }
}

/// Processing node handle
struct AlsaNode {
    stop: Arc<AtomicBool>,
}

impl ProcessingNode for AlsaNode {
    fn disconnect(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for AlsaNode {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Capture thread: read periods until a full block is assembled, then deliver it
fn read_loop(
    pcm: SharedPcm,
    block_size: usize,
    period: usize,
    stop: Arc<AtomicBool>,
    mut on_block: BlockCallback,
    on_error: ErrorCallback,
) {
    let mut block = vec![0f32; block_size];
    let mut filled = 0usize;
    let mut failure = None;

    info!("ALSA capture thread started ({} samples per block)", block_size);

    while !stop.load(Ordering::Relaxed) {
        let read = {
            let guard = pcm.lock();
            let Some(pcm) = guard.as_ref() else {
                failure = Some(AppError::AudioError(
                    "Microphone track ended while capturing".to_string(),
                ));
                break;
            };

            match pcm.state() {
                State::XRun => {
                    warn!("Audio buffer overrun, recovering");
                    let _ = pcm.prepare();
                    continue;
                }
                State::Suspended => {
                    warn!("Audio device suspended, recovering");
                    let _ = pcm.resume();
                    continue;
                }
                State::Disconnected => {
                    failure = Some(AppError::AudioError(
                        "Capture device disconnected".to_string(),
                    ));
                    break;
                }
                _ => {}
            }

            let io = match pcm.io_f32() {
                Ok(io) => io,
                Err(e) => {
                    failure = Some(AppError::AudioError(format!(
                        "Capture device does not deliver f32 samples: {}",
                        e
                    )));
                    break;
                }
            };

            let end = (filled + period).min(block_size);
            match io.readi(&mut block[filled..end]) {
                Ok(frames) => frames,
                Err(e) => {
                    let desc = e.to_string();
                    if desc.contains("EPIPE") || desc.contains("Broken pipe") {
                        warn!("Audio buffer overrun");
                        let _ = pcm.prepare();
                        continue;
                    }
                    failure = Some(AppError::AudioError(format!("Audio read error: {}", e)));
                    break;
                }
            }
        };

        filled += read;
        if filled == block_size {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            on_block(&block);
            filled = 0;
        }
    }

    // A failure racing a regular disconnect is not reported
    if let Some(e) = failure {
        if !stop.load(Ordering::Relaxed) {
            error!("ALSA capture failed: {}", e);
            on_error(e);
        }
    }

    info!("ALSA capture thread stopped");
}
