//! Microphone capture graph controller
//!
//! Owns the capture graph (microphone stream, processing context, processing
//! node) and turns every delivered block into an [`AudioChunk`] for the sink.
//! The three graph members live in one [`CaptureGraph`] value held in a single
//! `Option`, so the controller is either fully capturing or fully idle.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backend::{
    BlockCallback, CaptureBackend, ErrorCallback, MicrophoneRequest, MicrophoneStream,
    ProcessingContext, ProcessingNode,
};
use super::pcm::AudioChunk;
use crate::config::CaptureConfig;
use crate::error::{AppError, Result};
use crate::events::{AvatarEvent, EventBus};

/// Recording state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingState::Idle => write!(f, "idle"),
            RecordingState::Recording => write!(f, "recording"),
        }
    }
}

/// Receiver of encoded chunks
///
/// Called on the backend's audio thread, once per block, in capture order.
pub trait ChunkSink: Send + Sync {
    fn send(&self, chunk: AudioChunk);
}

/// Live capture resources, all present together
pub struct CaptureGraph {
    stream: Box<dyn MicrophoneStream>,
    context: Box<dyn ProcessingContext>,
    node: Box<dyn ProcessingNode>,
}

impl CaptureGraph {
    /// Best-effort teardown: every step runs even if an earlier one fails
    async fn teardown(mut self) {
        if let Err(e) = self.node.disconnect() {
            warn!("Failed to disconnect processing node: {}", e);
        }
        if let Err(e) = self.context.close().await {
            debug!("Processing context close: {}", e);
        }
        let stopped = self.stream.stop_all();
        debug!("Stopped {} microphone track(s)", stopped);
    }

    /// Synchronous teardown for drop paths; the context close is detached
    fn teardown_detached(mut self) {
        if let Err(e) = self.node.disconnect() {
            warn!("Failed to disconnect processing node: {}", e);
        }
        let stopped = self.stream.stop_all();
        debug!("Stopped {} microphone track(s) on release", stopped);

        let mut context = self.context;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = context.close().await {
                        debug!("Processing context close: {}", e);
                    }
                });
            }
            Err(_) => drop(context),
        }
    }
}

/// Capture counters
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// Blocks delivered to the sink since creation
    pub blocks_delivered: u64,
    /// Successful recording starts
    pub recordings_started: u64,
}

/// Capture graph controller
pub struct CaptureController {
    config: CaptureConfig,
    backend: Arc<dyn CaptureBackend>,
    sink: Arc<dyn ChunkSink>,
    graph: Mutex<Option<CaptureGraph>>,
    /// Held while a graph is installed or torn down, until the state matches
    lifecycle: tokio::sync::Mutex<()>,
    state: watch::Sender<RecordingState>,
    state_rx: watch::Receiver<RecordingState>,
    /// A permission request is in flight
    starting: AtomicBool,
    /// Bumped by every stop; a grant from an older generation is stale
    generation: AtomicU64,
    last_error: RwLock<Option<String>>,
    blocks_delivered: Arc<AtomicU64>,
    recordings_started: AtomicU64,
    events: Option<Arc<EventBus>>,
}

impl CaptureController {
    pub fn new(
        config: CaptureConfig,
        backend: Arc<dyn CaptureBackend>,
        sink: Arc<dyn ChunkSink>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(RecordingState::Idle);

        Self {
            config,
            backend,
            sink,
            graph: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            state: state_tx,
            state_rx,
            starting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            last_error: RwLock::new(None),
            blocks_delivered: Arc::new(AtomicU64::new(0)),
            recordings_started: AtomicU64::new(0),
            events: None,
        }
    }

    /// Publish recording changes and capture errors on `events`
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> RecordingState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<RecordingState> {
        self.state_rx.clone()
    }

    /// Whether the capture graph is currently built
    pub fn is_capturing(&self) -> bool {
        self.graph.lock().is_some()
    }

    /// Message of the last failed `start` or capture failure, cleared by the
    /// next successful start
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            blocks_delivered: self.blocks_delivered.load(Ordering::Relaxed),
            recordings_started: self.recordings_started.load(Ordering::Relaxed),
        }
    }

    /// Start capturing
    ///
    /// No-op while capturing or while a start is already pending. On failure
    /// the error message is kept for [`last_error`](Self::last_error), nothing
    /// stays acquired and the state remains `Idle`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_capturing() {
            debug!("Capture already running");
            return Ok(());
        }
        if self.starting.swap(true, Ordering::SeqCst) {
            debug!("Capture start already pending");
            return Ok(());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let result = self.build_graph(generation).await;
        self.starting.store(false, Ordering::SeqCst);

        match result {
            Ok(true) => {
                info!("Microphone capture started");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!("Failed to start microphone capture: {}", e);
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Acquire the microphone, wire the graph and enter `Recording`
    ///
    /// Returns `Ok(false)` when `stop` ran while the permission request was
    /// pending; the late grant is released instead of installed.
    async fn build_graph(self: &Arc<Self>, generation: u64) -> Result<bool> {
        let request = MicrophoneRequest {
            device: self.config.device.clone(),
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
        };

        // Not under the lifecycle lock, so stop can cancel a pending prompt
        let stream = self.backend.request_microphone(&request).await?;

        let _lifecycle = self.lifecycle.lock().await;

        if self.generation.load(Ordering::SeqCst) != generation {
            let stopped = stream.stop_all();
            info!(
                "Discarding microphone grant that arrived after stop ({} track(s))",
                stopped
            );
            return Ok(false);
        }

        let mut context = match self.backend.create_context(stream.as_ref()) {
            Ok(context) => context,
            Err(e) => {
                stream.stop_all();
                return Err(e);
            }
        };

        let on_block = self.block_callback(context.sample_rate());
        let on_error = self.error_callback(generation);
        let node = match context.create_processor(self.config.block_size, on_block, on_error) {
            Ok(node) => node,
            Err(e) => {
                if let Err(close_err) = context.close().await {
                    debug!("Processing context close: {}", close_err);
                }
                stream.stop_all();
                return Err(e);
            }
        };

        let graph = CaptureGraph {
            stream,
            context,
            node,
        };

        // `release` does not take the lifecycle lock; checked under the graph
        // lock so it either sees the graph or makes us release it
        let rejected = {
            let mut slot = self.graph.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                Some(graph)
            } else {
                *slot = Some(graph);
                None
            }
        };

        match rejected {
            Some(graph) => {
                info!("Capture stopped while wiring the graph, releasing it");
                graph.teardown().await;
                Ok(false)
            }
            None => {
                *self.last_error.write() = None;
                self.recordings_started.fetch_add(1, Ordering::Relaxed);
                self.set_state(RecordingState::Recording);
                Ok(true)
            }
        }
    }

    fn block_callback(&self, sample_rate: u32) -> BlockCallback {
        let sink = self.sink.clone();
        let delivered = self.blocks_delivered.clone();
        let mut sequence = 0u64;

        Box::new(move |samples: &[f32]| {
            let chunk = AudioChunk::encode(samples, sample_rate, sequence);
            sequence += 1;
            delivered.fetch_add(1, Ordering::Relaxed);
            sink.send(chunk);
        })
    }

    /// Failure report for the node built under `generation`
    ///
    /// Runs on the backend's thread, so the teardown is handed to the runtime.
    fn error_callback(self: &Arc<Self>, generation: u64) -> ErrorCallback {
        let controller = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::current();

        Box::new(move |e: AppError| {
            runtime.spawn(async move {
                if let Some(controller) = controller.upgrade() {
                    controller.abort_capture(generation, e).await;
                }
            });
        })
    }

    /// Tear down a graph whose node died while recording
    async fn abort_capture(&self, generation: u64, e: AppError) {
        let _lifecycle = self.lifecycle.lock().await;

        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Ignoring failure of an already stopped capture: {}", e);
            return;
        }

        warn!("Microphone capture failed: {}", e);
        let graph = self.graph.lock().take();
        if let Some(graph) = graph {
            graph.teardown().await;
        }
        self.record_error(&e);
        self.set_state(RecordingState::Idle);
    }

    fn record_error(&self, e: &AppError) {
        *self.last_error.write() = Some(e.to_string());
        self.publish(AvatarEvent::CaptureError {
            code: e.code().to_string(),
            message: e.to_string(),
        });
    }

    /// Stop capturing
    ///
    /// Idempotent. Disconnects the node, closes the context and stops every
    /// track; the state is `Idle` afterwards regardless of teardown errors.
    /// Also cancels a start whose permission request is still pending.
    pub async fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _lifecycle = self.lifecycle.lock().await;

        let graph = self.graph.lock().take();
        if let Some(graph) = graph {
            graph.teardown().await;
            info!("Microphone capture stopped");
        }

        self.set_state(RecordingState::Idle);
    }

    /// Synchronous teardown for drop paths
    ///
    /// Tracks are stopped before returning; the context close runs on the
    /// current runtime if there is one.
    pub fn release(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let graph = self.graph.lock().take();
        if let Some(graph) = graph {
            graph.teardown_detached();
            info!("Microphone capture released");
        }

        self.set_state(RecordingState::Idle);
    }

    fn set_state(&self, state: RecordingState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            self.publish(AvatarEvent::RecordingStateChanged {
                recording: state == RecordingState::Recording,
            });
        }
    }

    fn publish(&self, event: AvatarEvent) {
        if let Some(ref events) = self.events {
            events.publish(event);
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        if let Some(graph) = self.graph.get_mut().take() {
            graph.teardown_detached();
        }
    }
}
