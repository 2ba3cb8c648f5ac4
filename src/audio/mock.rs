//! In-memory capture backend for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::backend::{
    BlockCallback, CaptureBackend, ErrorCallback, MediaTrack, MicrophoneRequest,
    MicrophoneStream, ProcessingContext, ProcessingNode,
};
use crate::error::{AppError, Result};

pub struct MockTrack {
    label: String,
    stops: AtomicUsize,
    live: AtomicBool,
}

impl MockTrack {
    fn new(label: String) -> Self {
        Self {
            label,
            stops: AtomicUsize::new(0),
            live: AtomicBool::new(true),
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockTrack {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Shared {
    tracks: Mutex<Vec<Arc<MockTrack>>>,
    callback: Mutex<Option<BlockCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    close_gate: Mutex<Option<Arc<Notify>>>,
    requests: AtomicUsize,
    disconnects: AtomicUsize,
    context_closes: AtomicUsize,
}

struct MockStream {
    tracks: Vec<Arc<MockTrack>>,
    sample_rate: u32,
}

impl MicrophoneStream for MockStream {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks
            .iter()
            .map(|t| t.clone() as Arc<dyn MediaTrack>)
            .collect()
    }
}

struct MockContext {
    shared: Arc<Shared>,
    sample_rate: u32,
    closed: bool,
    fail_close: bool,
    fail_processor: bool,
}

#[async_trait]
impl ProcessingContext for MockContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn create_processor(
        &mut self,
        _block_size: usize,
        on_block: BlockCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn ProcessingNode>> {
        if self.fail_processor {
            return Err(AppError::AudioError("processor unavailable".to_string()));
        }
        *self.shared.callback.lock() = Some(on_block);
        *self.shared.on_error.lock() = Some(on_error);
        Ok(Box::new(MockNode {
            shared: self.shared.clone(),
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.context_closes.fetch_add(1, Ordering::SeqCst);

        let gate = self.shared.close_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.closed {
            return Err(AppError::AudioError("context already closed".to_string()));
        }
        self.closed = true;
        if self.fail_close {
            return Err(AppError::AudioError("close failed".to_string()));
        }
        Ok(())
    }
}

struct MockNode {
    shared: Arc<Shared>,
}

impl ProcessingNode for MockNode {
    fn disconnect(&mut self) -> Result<()> {
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        self.shared.callback.lock().take();
        self.shared.on_error.lock().take();
        Ok(())
    }
}

/// Capture backend whose tracks count their `stop` calls
///
/// Blocks are pushed by the test through [`emit`](Self::emit).
pub struct MockBackend {
    shared: Arc<Shared>,
    tracks_per_stream: usize,
    deny: AtomicBool,
    fail_close: AtomicBool,
    fail_processor: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockBackend {
    pub fn new(tracks_per_stream: usize) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            tracks_per_stream,
            deny: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            fail_processor: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    pub fn deny_permission(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn fail_context_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn fail_processor(&self, fail: bool) {
        self.fail_processor.store(fail, Ordering::SeqCst);
    }

    /// Make permission requests wait until [`release_permission`](Self::release_permission)
    pub fn hold_permission(&self) {
        *self.gate.lock() = Some(Arc::new(Notify::new()));
    }

    pub fn release_permission(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.notify_one();
        }
    }

    /// Make context closes wait until [`release_context_close`](Self::release_context_close)
    pub fn hold_context_close(&self) {
        *self.shared.close_gate.lock() = Some(Arc::new(Notify::new()));
    }

    pub fn release_context_close(&self) {
        if let Some(gate) = self.shared.close_gate.lock().take() {
            gate.notify_one();
        }
    }

    /// Kill the connected node as a device failure would; false if none is connected
    pub fn fail_node(&self, message: &str) -> bool {
        let on_error = self.shared.on_error.lock().take();
        match on_error {
            Some(on_error) => {
                self.shared.callback.lock().take();
                on_error(AppError::AudioError(message.to_string()));
                true
            }
            None => false,
        }
    }

    /// Deliver one block through the connected node; false if none is connected
    pub fn emit(&self, samples: &[f32]) -> bool {
        let mut callback = self.shared.callback.lock();
        match callback.as_mut() {
            Some(cb) => {
                cb(samples);
                true
            }
            None => false,
        }
    }

    pub fn tracks(&self) -> Vec<Arc<MockTrack>> {
        self.shared.tracks.lock().clone()
    }

    pub fn track_stop_counts(&self) -> Vec<usize> {
        self.tracks().iter().map(|t| t.stop_count()).collect()
    }

    pub fn request_count(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    pub fn context_close_count(&self) -> usize {
        self.shared.context_closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn request_microphone(
        &self,
        request: &MicrophoneRequest,
    ) -> Result<Box<dyn MicrophoneStream>> {
        self.shared.requests.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.deny.load(Ordering::SeqCst) {
            return Err(AppError::PermissionDenied(format!(
                "{}: permission denied by user",
                request.device
            )));
        }

        let tracks: Vec<Arc<MockTrack>> = (0..self.tracks_per_stream)
            .map(|i| Arc::new(MockTrack::new(format!("mock-mic-{}", i))))
            .collect();
        self.shared.tracks.lock().extend(tracks.iter().cloned());

        Ok(Box::new(MockStream {
            tracks,
            sample_rate: request.sample_rate,
        }))
    }

    fn create_context(&self, stream: &dyn MicrophoneStream) -> Result<Box<dyn ProcessingContext>> {
        let stream = stream
            .as_any()
            .downcast_ref::<MockStream>()
            .ok_or_else(|| AppError::AudioError("foreign stream".to_string()))?;

        Ok(Box::new(MockContext {
            shared: self.shared.clone(),
            sample_rate: stream.sample_rate,
            closed: false,
            fail_close: self.fail_close.load(Ordering::SeqCst),
            fail_processor: self.fail_processor.load(Ordering::SeqCst),
        }))
    }
}
