//! Session connection manager
//!
//! Owns the single session handle of an avatar view. Setup runs on a spawned
//! task: poll the render targets, build the session through the factory, start
//! it, then apply transport notifications through [`transition`]. Failures end
//! up in the connection state; nothing is returned to the caller.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::targets::{RenderTargets, ResolvedTargets};
use super::transport::{AvatarSession, SessionFactory};
use super::types::{transition, ConnectionState, SessionEvent};
use crate::config::SessionConfig;
use crate::events::{AvatarEvent, EventBus};

/// State and handle, always read and written together
struct Slot {
    state: ConnectionState,
    reason: Option<String>,
    session: Option<Arc<dyn AvatarSession>>,
}

/// Session connection manager
pub struct SessionManager {
    config: SessionConfig,
    factory: Arc<dyn SessionFactory>,
    targets: RenderTargets,
    slot: RwLock<Slot>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    mounted: AtomicBool,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    events: Option<Arc<EventBus>>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn SessionFactory>,
        targets: RenderTargets,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Uninitialized);

        Self {
            config,
            factory,
            targets,
            slot: RwLock::new(Slot {
                state: ConnectionState::Uninitialized,
                reason: None,
                session: None,
            }),
            state_tx,
            state_rx,
            cancel: CancellationToken::new(),
            mounted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
            events: None,
        }
    }

    /// Publish state changes and target waits on `events`
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn current_state(&self) -> ConnectionState {
        self.slot.read().state
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Why the session failed or disconnected, if it did
    pub fn reason(&self) -> Option<String> {
        self.slot.read().reason.clone()
    }

    /// The live session, only while `Connected`
    pub fn active_handle(&self) -> Option<Arc<dyn AvatarSession>> {
        let slot = self.slot.read();
        match slot.state {
            ConnectionState::Connected => slot.session.clone(),
            _ => None,
        }
    }

    /// Begin setup in the background
    ///
    /// Returns immediately. A manager mounts once; a second call is ignored.
    pub fn mount(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Session manager already closed, not mounting");
            return;
        }
        if self.mounted.swap(true, Ordering::SeqCst) {
            debug!("Session manager already mounted");
            return;
        }

        self.set_state(ConnectionState::Initializing, None);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run().await });
        *self.task.lock() = Some(handle);
    }

    async fn run(&self) {
        let Some(targets) = self.wait_for_targets().await else {
            return;
        };
        if self.is_closed() {
            debug!("Manager closed before the session was created");
            return;
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = match self.factory.create(&self.config, targets, events_tx) {
            Ok(session) => session,
            Err(e) => {
                self.fail(format!("Failed to create session: {}", e));
                return;
            }
        };

        // Registered before start so close() can release it mid-connect
        let rejected = {
            let mut slot = self.slot.write();
            if self.closed.load(Ordering::SeqCst) {
                true
            } else {
                slot.session = Some(session.clone());
                false
            }
        };
        if rejected {
            session.close().await;
            return;
        }

        info!("Starting avatar session ({})", self.factory.name());
        if let Err(e) = session.start().await {
            self.fail(format!("Failed to start session: {}", e));
            return;
        }

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events_rx.recv() => event,
            };

            let event = event.unwrap_or_else(|| SessionEvent::Disconnected {
                reason: "Session transport went away".to_string(),
            });
            self.apply(event).await;

            if self.current_state().is_terminal() {
                break;
            }
        }
    }

    /// Poll until both render targets exist; `None` on cancel or exhaustion
    async fn wait_for_targets(&self) -> Option<ResolvedTargets> {
        let attempts = self.config.target_poll_attempts.max(1);
        let interval = self.config.target_poll_interval();

        for attempt in 1..=attempts {
            if self.is_closed() {
                return None;
            }
            if let Some(targets) = self.targets.resolve() {
                debug!("Render targets ready after {} attempt(s)", attempt);
                return Some(targets);
            }
            if attempt == attempts {
                break;
            }

            debug!("Render targets not ready (attempt {}/{})", attempt, attempts);
            self.publish(AvatarEvent::WaitingForTargets {
                attempt,
                max_attempts: attempts,
            });

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.fail(format!(
            "Render targets unavailable after {} attempts",
            attempts
        ));
        None
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.closed.load(Ordering::SeqCst)
    }

    async fn apply(&self, event: SessionEvent) {
        let (next, released) = {
            let mut slot = self.slot.write();
            match transition(slot.state, &event) {
                Some(next) => {
                    slot.state = next;
                    slot.reason = event.reason().map(str::to_string);
                    let released = match next {
                        ConnectionState::Connected => None,
                        _ => slot.session.take(),
                    };
                    (Some(next), released)
                }
                None => (None, None),
            }
        };

        match next {
            Some(next) => {
                match next {
                    ConnectionState::Connected => info!("Avatar session connected"),
                    ConnectionState::Failed => error!(
                        "Avatar session failed: {}",
                        event.reason().unwrap_or("unknown")
                    ),
                    _ => warn!(
                        "Avatar session {}: {}",
                        next,
                        event.reason().unwrap_or("unknown")
                    ),
                }
                self.notify(next, event.reason().map(str::to_string));
            }
            None => debug!(
                "Ignoring {} notification in state {}",
                event.name(),
                self.current_state()
            ),
        }

        if let Some(session) = released {
            session.close().await;
        }
    }

    /// Move a non-terminal state to `Failed`
    fn fail(&self, reason: String) {
        let moved = {
            let mut slot = self.slot.write();
            if slot.state.is_terminal() {
                false
            } else {
                slot.state = ConnectionState::Failed;
                slot.reason = Some(reason.clone());
                true
            }
        };

        if moved {
            error!("Avatar session setup failed: {}", reason);
            self.notify(ConnectionState::Failed, Some(reason));
        }
    }

    /// Release the session and stop setup
    ///
    /// Idempotent. A non-terminal state becomes `Disconnected`; `Failed` stays.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let (session, moved) = {
            let mut slot = self.slot.write();
            let moved = !slot.state.is_terminal();
            if moved {
                slot.state = ConnectionState::Disconnected;
                slot.reason = Some("Closed".to_string());
            }
            (slot.session.take(), moved)
        };

        if moved {
            self.notify(ConnectionState::Disconnected, Some("Closed".to_string()));
        }
        if let Some(session) = session {
            session.close().await;
        }
        // Setup loop exits on cancel
        self.task.lock().take();

        info!("Session manager closed");
    }

    /// Synchronous variant of [`close`](Self::close) for drop paths
    ///
    /// The session itself is closed on the current runtime, if there is one.
    pub fn close_detached(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move { this.close().await });
            }
            Err(_) => {
                self.closed.store(true, Ordering::SeqCst);
                self.cancel.cancel();
                self.slot.write().session.take();
            }
        }
    }

    fn set_state(&self, state: ConnectionState, reason: Option<String>) {
        {
            let mut slot = self.slot.write();
            slot.state = state;
            slot.reason = reason.clone();
        }
        self.notify(state, reason);
    }

    fn notify(&self, state: ConnectionState, reason: Option<String>) {
        self.state_tx.send_replace(state);
        self.publish(AvatarEvent::SessionStateChanged { state, reason });
    }

    fn publish(&self, event: AvatarEvent) {
        if let Some(ref events) = self.events {
            events.publish(event);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
