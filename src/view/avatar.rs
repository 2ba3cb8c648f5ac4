//! UI-facing avatar coordinator
//!
//! Wires the session manager, the streaming dispatcher and the capture
//! controller together, and enforces the cross-component policy: capture
//! stops whenever the session leaves `Connected`, and everything is released
//! when the view goes away.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::status::{AvatarStatus, StatusView};
use crate::audio::{CaptureBackend, CaptureController, CaptureStats, RecordingState};
use crate::config::AppConfig;
use crate::events::EventBus;
use crate::session::{ConnectionState, RenderTargets, SessionFactory, SessionManager};
use crate::stream::{DispatchStats, StreamDispatcher};

/// One avatar view: a session, a microphone, and the glue between them
pub struct AvatarView {
    sessions: Arc<SessionManager>,
    dispatcher: Arc<StreamDispatcher>,
    capture: Arc<CaptureController>,
    events: Arc<EventBus>,
    guard: Mutex<Option<JoinHandle<()>>>,
}

impl AvatarView {
    pub fn new(
        config: &AppConfig,
        backend: Arc<dyn CaptureBackend>,
        factory: Arc<dyn SessionFactory>,
        targets: RenderTargets,
        events: Arc<EventBus>,
    ) -> Self {
        let sessions = Arc::new(
            SessionManager::new(config.session.clone(), factory, targets)
                .with_event_bus(events.clone()),
        );
        let dispatcher = Arc::new(StreamDispatcher::new(sessions.clone()));
        let capture = Arc::new(
            CaptureController::new(config.capture.clone(), backend, dispatcher.clone())
                .with_event_bus(events.clone()),
        );

        Self {
            sessions,
            dispatcher,
            capture,
            events,
            guard: Mutex::new(None),
        }
    }

    /// Start session setup and the disconnect guard
    pub fn mount(&self) {
        let mut guard = self.guard.lock();
        if guard.is_some() {
            debug!("Avatar view already mounted");
            return;
        }

        self.sessions.mount();
        *guard = Some(spawn_disconnect_guard(
            self.sessions.state_watch(),
            self.capture.clone(),
        ));
        info!("Avatar view mounted");
    }

    pub fn current_status(&self) -> AvatarStatus {
        AvatarStatus::project(self.sessions.current_state(), self.capture.state())
    }

    pub fn status_view(&self) -> StatusView {
        StatusView::new(
            self.sessions.current_state(),
            self.capture.state(),
            self.sessions.reason().as_deref(),
            self.capture.last_error(),
        )
    }

    /// Start or stop recording; returns the resulting recording state
    ///
    /// Starting is refused unless the session is connected. A microphone
    /// failure is kept for [`mic_error_message`](Self::mic_error_message).
    pub async fn toggle_recording(&self) -> RecordingState {
        if self.capture.state() == RecordingState::Recording {
            self.capture.stop().await;
            return self.capture.state();
        }

        if !self.current_status().can_record() {
            debug!(
                "Not starting capture while session is {}",
                self.sessions.current_state()
            );
            return self.capture.state();
        }

        if let Err(e) = self.capture.start().await {
            debug!("Recording not started: {}", e);
        }

        // The session may have ended after the check above, in which case the
        // disconnect guard's stop can run before this start acquired anything
        let connection = self.sessions.current_state();
        if connection != ConnectionState::Connected && self.capture.is_capturing() {
            info!("Session {} while starting capture, stopping it", connection);
            self.capture.stop().await;
        }
        self.capture.state()
    }

    pub fn mic_error_message(&self) -> Option<String> {
        self.capture.last_error()
    }

    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.sessions.state_watch()
    }

    pub fn recording_watch(&self) -> watch::Receiver<RecordingState> {
        self.capture.state_watch()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    /// Stop capture and close the session
    pub async fn unmount(&self) {
        if let Some(guard) = self.guard.lock().take() {
            guard.abort();
        }
        self.capture.stop().await;
        self.sessions.close().await;
        info!("Avatar view unmounted");
    }
}

impl Drop for AvatarView {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.get_mut().take() {
            guard.abort();
        }
        // Tracks are stopped before drop returns
        self.capture.release();
        self.sessions.close_detached();
    }
}

/// Stop capture as soon as the session reaches a terminal state
fn spawn_disconnect_guard(
    mut connection: watch::Receiver<ConnectionState>,
    capture: Arc<CaptureController>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let state = *connection.borrow_and_update();
            if state.is_terminal() {
                if capture.state() == RecordingState::Recording || capture.is_capturing() {
                    info!("Session {}, stopping microphone capture", state);
                }
                // Also cancels a start still waiting for permission
                capture.stop().await;
                break;
            }
            if connection.changed().await.is_err() {
                break;
            }
        }
    })
}
