//! Microphone capture and encoding
//!
//! This module provides:
//! - PCM16 sample encoding
//! - The capture backend traits and the ALSA backend
//! - Microphone enumeration
//! - The capture graph controller

pub mod alsa_backend;
pub mod backend;
pub mod capture;
pub mod device;
pub mod pcm;

#[cfg(test)]
pub(crate) mod mock;

pub use alsa_backend::AlsaBackend;
pub use backend::{
    BlockCallback, CaptureBackend, ErrorCallback, MediaTrack, MicrophoneRequest,
    MicrophoneStream, ProcessingContext, ProcessingNode,
};
pub use capture::{CaptureController, CaptureGraph, CaptureStats, ChunkSink, RecordingState};
pub use device::{enumerate_microphones, MicrophoneInfo};
pub use pcm::{decode_pcm16, encode_pcm16, AudioChunk};
