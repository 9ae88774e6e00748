//! Audio hardware boundary
//!
//! Capture runs at a fixed 16kHz input rate, playback at a fixed 24kHz output
//! rate, mono throughout. The controller talks to hardware only through the
//! traits in this module; `CpalBackend` is the real implementation.

mod capture;
mod device;
mod output;
pub mod pcm;
mod playback;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use capture::AudioCapturePipe;
pub use device::CpalBackend;
pub use output::Mixer;
pub use pcm::AudioChunk;
pub use playback::{PlaybackScheduler, Scheduled};

/// Capture sample rate expected by the remote engine
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized speech coming back
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture callback
pub const CAPTURE_FRAME_SIZE: usize = 4096;

/// Identifies one scheduled playback source on an output sink
pub type SourceId = u64;

/// Errors that can occur in the audio layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    PermissionDenied(String),
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    ContextClosed,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::PermissionDenied(e) => write!(f, "Microphone permission denied: {}", e),
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device available"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::ContextClosed => write!(f, "Audio context is closed"),
        }
    }
}

impl std::error::Error for AudioError {}

/// Output context plus its mixing node.
///
/// The playback clock only advances while the context is running.
pub trait OutputSink: Send + Sync {
    fn resume(&self) -> Result<(), AudioError>;

    /// Playback clock in seconds since the context started
    fn current_time(&self) -> f64;

    /// Schedule `samples` (at `sample_rate`) to begin at clock time `at`.
    fn start_source(
        &self,
        samples: Arc<[f32]>,
        sample_rate: u32,
        at: f64,
    ) -> Result<SourceId, AudioError>;

    fn stop_source(&self, id: SourceId);

    /// Disconnect the mixing node; every source it holds goes silent.
    fn disconnect(&self);

    fn close(&self) -> Result<(), AudioError>;

    fn is_closed(&self) -> bool;
}

/// A live microphone stream delivering fixed-size frames.
pub trait Microphone: Send {
    /// Hand out the frame receiver. Only the first call returns it.
    fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<f32>>>;

    /// Stop every track of the stream
    fn stop(&mut self);
}

/// Capture-side audio context.
pub trait CaptureContext: Send {
    fn resume(&mut self) -> Result<(), AudioError>;

    fn acquire_microphone(&mut self, frame_size: usize)
        -> Result<Box<dyn Microphone>, AudioError>;

    fn close(&mut self) -> Result<(), AudioError>;

    fn is_closed(&self) -> bool;
}

/// Factory for the two audio contexts of a session attempt.
pub trait AudioBackend: Send + Sync {
    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputSink>, AudioError>;

    fn open_capture(&self, sample_rate: u32) -> Result<Box<dyn CaptureContext>, AudioError>;
}
