//! PCM16 wire codec and sample-rate helpers
//!
//! The duplex channel carries mono little-endian PCM16, base64 encoded.
//! Internally audio is mono `f32` in `[-1.0, 1.0]`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};

/// A decoded chunk of mono audio. Immutable once produced.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Errors decoding an inbound audio payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcmError {
    InvalidBase64(String),
    OddByteCount(usize),
}

impl std::fmt::Display for PcmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PcmError::InvalidBase64(e) => write!(f, "Invalid base64 audio payload: {}", e),
            PcmError::OddByteCount(n) => {
                write!(f, "PCM16 payload has an odd byte count ({} bytes)", n)
            }
        }
    }
}

impl std::error::Error for PcmError {}

/// Convert a float sample to i16, clamping out-of-range input.
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

pub fn sample_from_i16(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode float samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| sample_to_i16(s).to_le_bytes())
        .collect()
}

pub fn encode_base64(samples: &[f32]) -> String {
    STANDARD.encode(encode_pcm16(samples))
}

pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, PcmError> {
    if bytes.len() % 2 != 0 {
        return Err(PcmError::OddByteCount(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| sample_from_i16(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Decode a base64 PCM16 payload into an [`AudioChunk`].
pub fn decode_base64(data: &str, sample_rate: u32) -> Result<AudioChunk, PcmError> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| PcmError::InvalidBase64(e.to_string()))?;
    Ok(AudioChunk::new(decode_pcm16(&bytes)?, sample_rate))
}

/// Mime type for PCM16 at the given rate, e.g. `audio/pcm;rate=16000`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a PCM mime type.
pub fn sample_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Average interleaved channels down to mono.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler for speech audio.
///
/// Returns the input unchanged when the rates match or either rate is zero.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}

/// Linear resampler for a continuous stream delivered in buffers.
///
/// The read position and the previous buffer's last sample carry over, so
/// buffer boundaries neither repeat a sample nor drift in length.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    /// Source samples per output sample
    step: f64,
    /// Next read position relative to the start of the next buffer; -1.0
    /// means the previous buffer's last sample
    pos: f64,
    last: Option<f32>,
    passthrough: bool,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        let passthrough = source_rate == target_rate || source_rate == 0 || target_rate == 0;
        Self {
            step: if passthrough {
                1.0
            } else {
                source_rate as f64 / target_rate as f64
            },
            pos: 0.0,
            last: None,
            passthrough,
        }
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.passthrough || input.is_empty() {
            return input.to_vec();
        }

        let len = input.len() as i64;
        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);

        loop {
            let idx = self.pos.floor() as i64;
            if idx + 1 >= len {
                break;
            }
            let frac = (self.pos - idx as f64) as f32;
            let a = if idx < 0 {
                self.last.unwrap_or(input[0])
            } else {
                input[idx as usize]
            };
            let b = input[(idx + 1) as usize];
            out.push(a * (1.0 - frac) + b * frac);
            self.pos += self.step;
        }

        self.pos -= len as f64;
        self.last = input.last().copied();
        out
    }
}
