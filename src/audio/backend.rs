//! Capture backend traits
//!
//! The capture controller builds its graph (microphone stream, processing
//! context, processing node) through these traits only. The ALSA backend
//! implements them for real hardware; tests plug in a mock.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::error::{AppError, Result};

/// Callback invoked by a processing node with one block of `f32` samples
///
/// Called from the backend's audio thread, in capture order.
pub type BlockCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Callback invoked at most once when a running node fails and stops delivering
pub type ErrorCallback = Box<dyn FnOnce(AppError) + Send + 'static>;

/// Microphone constraints passed to the permission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrophoneRequest {
    pub device: String,
    pub sample_rate: u32,
    pub channels: u32,
}

/// Source of microphone streams and processing contexts
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Backend name
    fn name(&self) -> &'static str;

    /// Request microphone access
    ///
    /// This is the permission prompt: it may take arbitrarily long, and may
    /// fail with `PermissionDenied` or `DeviceUnavailable`.
    async fn request_microphone(&self, request: &MicrophoneRequest)
        -> Result<Box<dyn MicrophoneStream>>;

    /// Create a processing context fed by `stream`
    fn create_context(&self, stream: &dyn MicrophoneStream) -> Result<Box<dyn ProcessingContext>>;
}

/// A granted microphone stream
pub trait MicrophoneStream: Send + Sync {
    /// Lets a backend recover its concrete stream type in `create_context`
    fn as_any(&self) -> &dyn Any;

    /// All tracks of the stream
    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>>;

    /// Stop every track; returns how many were live
    fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for track in self.tracks() {
            if track.is_live() {
                stopped += 1;
            }
            track.stop();
        }
        stopped
    }
}

/// One track of a microphone stream
pub trait MediaTrack: Send + Sync {
    fn label(&self) -> String;

    /// Release the device behind this track; calling it twice is harmless
    fn stop(&self);

    fn is_live(&self) -> bool;
}

/// Audio-processing context bound to a microphone stream
#[async_trait]
pub trait ProcessingContext: Send + Sync {
    /// Native sample rate of the context
    fn sample_rate(&self) -> u32;

    /// Create the processing node and connect it to the microphone source
    ///
    /// `on_block` receives `block_size` samples per call once the node runs.
    /// `on_error` fires if the node dies on its own (device unplugged, read
    /// failure); it is dropped unused when the node is disconnected.
    fn create_processor(
        &mut self,
        block_size: usize,
        on_block: BlockCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn ProcessingNode>>;

    /// Close the context; closing an already closed context is an error
    async fn close(&mut self) -> Result<()>;
}

/// Processing node delivering sample blocks
pub trait ProcessingNode: Send + Sync {
    /// Stop delivering blocks and detach from the graph
    fn disconnect(&mut self) -> Result<()>;
}
