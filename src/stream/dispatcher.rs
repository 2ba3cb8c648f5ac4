//! Streaming dispatcher
//!
//! Sits between the capture controller and the session manager. Each chunk is
//! checked against the manager's state at the moment it arrives: forwarded to
//! the live session while `Connected`, dropped otherwise. Nothing is buffered.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::audio::{AudioChunk, ChunkSink};
use crate::session::SessionManager;
use crate::utils::LogThrottler;

/// Dispatcher counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    /// Chunks handed to the session
    pub forwarded: u64,
    /// Chunks dropped because no session was connected
    pub dropped: u64,
    /// Chunks the session refused (queue full, transport gone)
    pub rejected: u64,
}

/// Gates encoded audio on the session's connection state
pub struct StreamDispatcher {
    sessions: Arc<SessionManager>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    throttler: LogThrottler,
}

impl StreamDispatcher {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            throttler: LogThrottler::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl ChunkSink for StreamDispatcher {
    fn send(&self, chunk: AudioChunk) {
        let Some(session) = self.sessions.active_handle() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(suppressed) = self.throttler.check("chunk_dropped") {
                debug!(
                    "Dropping audio chunk #{} ({} bytes): session {} ({} similar suppressed)",
                    chunk.sequence,
                    chunk.len(),
                    self.sessions.current_state(),
                    suppressed
                );
            }
            return;
        };

        let sequence = chunk.sequence;
        let duration_ms = chunk.duration_ms();
        match session.send_audio(chunk.data) {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                trace!("Forwarded audio chunk #{} ({:.1} ms)", sequence, duration_ms);
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = self.throttler.check("chunk_rejected") {
                    warn!(
                        "Session rejected audio chunk #{}: {} ({} similar suppressed)",
                        sequence, e, suppressed
                    );
                }
            }
        }
    }
}
