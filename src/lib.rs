//! avatar-stream - microphone streaming client for remote AI-avatar sessions
//!
//! This crate captures microphone audio, encodes it as PCM16, and streams it
//! to a remote avatar session while that session is connected.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod stream;
pub mod utils;
pub mod view;

pub use error::{AppError, Result};
