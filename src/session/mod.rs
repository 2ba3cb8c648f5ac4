//! Avatar session: connection state machine, render targets, transport

mod manager;
mod targets;
mod transport;
mod types;
pub mod ws;

#[cfg(test)]
pub(crate) mod mock;

pub use manager::SessionManager;
pub use targets::{LoggingSink, RenderSink, RenderTargets, ResolvedTargets, SinkKind};
pub use transport::{AvatarSession, SessionFactory};
pub use types::{transition, ConnectionState, SessionEvent};
pub use ws::{WsSession, WsSessionFactory};
