//! In-memory session transport for tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::targets::ResolvedTargets;
use super::transport::{AvatarSession, SessionFactory};
use super::types::SessionEvent;
use crate::config::SessionConfig;
use crate::error::{AppError, Result};

/// Session that records the audio it is given
///
/// Notifications are injected by the test through [`emit`](Self::emit).
pub struct MockSession {
    events: mpsc::UnboundedSender<SessionEvent>,
    auto_connect: bool,
    sent: Mutex<Vec<Bytes>>,
    starts: AtomicUsize,
    closes: AtomicUsize,
    reject_audio: AtomicBool,
}

impl MockSession {
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reject_audio(&self, reject: bool) {
        self.reject_audio.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl AvatarSession for MockSession {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.auto_connect {
            self.emit(SessionEvent::Connected);
        }
        Ok(())
    }

    fn send_audio(&self, pcm: Bytes) -> Result<()> {
        if self.reject_audio.load(Ordering::SeqCst) {
            return Err(AppError::TransportError("Audio queue full".to_string()));
        }
        self.sent.lock().push(pcm);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory handing out [`MockSession`]s
pub struct MockFactory {
    auto_connect: bool,
    fail_create: AtomicBool,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockFactory {
    /// `auto_connect` makes every session report `Connected` from `start`
    pub fn new(auto_connect: bool) -> Self {
        Self {
            auto_connect,
            fail_create: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Most recently created session
    pub fn session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl SessionFactory for MockFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create(
        &self,
        _config: &SessionConfig,
        _targets: ResolvedTargets,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn AvatarSession>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AppError::SessionError("invalid session configuration".to_string()));
        }

        let session = Arc::new(MockSession {
            events,
            auto_connect: self.auto_connect,
            sent: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            reject_audio: AtomicBool::new(false),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}
