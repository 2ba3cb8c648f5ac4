//! Audio streaming: capture output gated onto the avatar session

pub mod dispatcher;

pub use dispatcher::{DispatchStats, StreamDispatcher};
