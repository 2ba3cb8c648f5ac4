//! Render targets supplied by the presentation layer
//!
//! The session needs a video sink and an audio sink before it can be built.
//! The UI may attach them after the view mounts, so the session manager polls
//! [`RenderTargets::resolve`] until both are present.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Kind of render target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Video,
    Audio,
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkKind::Video => write!(f, "video"),
            SinkKind::Audio => write!(f, "audio"),
        }
    }
}

/// Sink the remote avatar stream is drawn into
pub trait RenderSink: Send + Sync {
    /// Receive one opaque media frame from the session
    fn render(&self, frame: Bytes);
}

/// Both render targets, as handed to a session
#[derive(Clone)]
pub struct ResolvedTargets {
    pub video: Arc<dyn RenderSink>,
    pub audio: Arc<dyn RenderSink>,
}

impl ResolvedTargets {
    pub fn sink(&self, kind: SinkKind) -> &Arc<dyn RenderSink> {
        match kind {
            SinkKind::Video => &self.video,
            SinkKind::Audio => &self.audio,
        }
    }
}

#[derive(Default)]
struct Slots {
    video: Option<Arc<dyn RenderSink>>,
    audio: Option<Arc<dyn RenderSink>>,
}

/// Shared holder for the two render targets
///
/// Clones share the same slots.
#[derive(Clone, Default)]
pub struct RenderTargets {
    slots: Arc<RwLock<Slots>>,
}

impl RenderTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_video(&self, sink: Arc<dyn RenderSink>) {
        self.slots.write().video = Some(sink);
    }

    pub fn attach_audio(&self, sink: Arc<dyn RenderSink>) {
        self.slots.write().audio = Some(sink);
    }

    pub fn detach_all(&self) {
        let mut slots = self.slots.write();
        slots.video = None;
        slots.audio = None;
    }

    /// Both targets, if both are attached
    pub fn resolve(&self) -> Option<ResolvedTargets> {
        let slots = self.slots.read();
        match (&slots.video, &slots.audio) {
            (Some(video), Some(audio)) => Some(ResolvedTargets {
                video: video.clone(),
                audio: audio.clone(),
            }),
            _ => None,
        }
    }
}

/// Sink that only counts and traces frames, for headless use
pub struct LoggingSink {
    kind: SinkKind,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl LoggingSink {
    pub fn new(kind: SinkKind) -> Self {
        Self {
            kind,
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl RenderSink for LoggingSink {
    fn render(&self, frame: Bytes) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        trace!("{} frame #{}: {} bytes", self.kind, n, frame.len());
    }
}
