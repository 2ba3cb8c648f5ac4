//! PCM16 sample encoding
//!
//! The avatar session expects signed 16-bit little-endian mono PCM. Samples
//! coming out of the processing node are `f32` nominally in [-1.0, 1.0].
//!
//! Scaling is asymmetric: negative samples are multiplied by 32768 and
//! non-negative samples by 32767, then truncated toward zero. This is the wire
//! contract of the receiving session and must not be "improved".

use bytes::{BufMut, Bytes, BytesMut};

/// Scale applied to negative samples
const NEG_SCALE: f32 = 32768.0;
/// Scale applied to zero and positive samples
const POS_SCALE: f32 = 32767.0;

/// Convert one normalized sample to PCM16
#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * NEG_SCALE) as i16
    } else {
        (s * POS_SCALE) as i16
    }
}

/// Encode normalized `f32` samples as PCM16 little-endian bytes
///
/// Output length is always `2 * samples.len()`; an empty input yields an
/// empty buffer.
pub fn encode_pcm16(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample_to_i16(sample));
    }
    buf.freeze()
}

/// Decode PCM16 little-endian bytes back to normalized samples
///
/// Inverse of [`encode_pcm16`] up to one quantization step. A trailing odd
/// byte is ignored.
pub fn decode_pcm16(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|pair| {
            let v = i16::from_le_bytes([pair[0], pair[1]]);
            if v < 0 {
                v as f32 / NEG_SCALE
            } else {
                v as f32 / POS_SCALE
            }
        })
        .collect()
}

/// One encoded frame of microphone audio
///
/// Produced per processing callback and handed straight to the dispatcher.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// PCM16LE mono payload
    pub data: Bytes,
    /// Number of source samples encoded in `data`
    pub samples: usize,
    /// Sample rate of the capture context
    pub sample_rate: u32,
    /// Per-recording sequence number, starting at 0
    pub sequence: u64,
}

impl AudioChunk {
    /// Encode a block of samples into a chunk
    pub fn encode(samples: &[f32], sample_rate: u32, sequence: u64) -> Self {
        Self {
            data: encode_pcm16(samples),
            samples: samples.len(),
            sample_rate,
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback duration of this chunk in milliseconds
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples as f64 * 1000.0 / self.sample_rate as f64
    }
}
