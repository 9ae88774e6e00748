//! Output mixing node
//!
//! Sources are resampled to the device rate when scheduled and summed in the
//! render callback. The clock is the number of frames rendered so far, so it
//! stands still while the output stream is paused.
//!
//! A source scheduled exactly where the previous one ends starts on the frame
//! the previous one ended on, so rounding never opens a gap between chunks.

use super::pcm::resample;
use super::SourceId;

#[derive(Debug)]
struct Voice {
    id: SourceId,
    samples: Vec<f32>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled sources into the device output buffer.
///
/// Not internally synchronized; the cpal sink wraps it in a mutex shared with
/// the render callback.
#[derive(Debug)]
pub struct Mixer {
    device_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    next_id: SourceId,
    connected: bool,
    /// Scheduled end (seconds) and end frame of the latest source
    tail: Option<(f64, u64)>,
}

impl Mixer {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate: device_rate.max(1),
            frames_rendered: 0,
            voices: Vec::new(),
            next_id: 1,
            connected: true,
            tail: None,
        }
    }

    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.device_rate as f64
    }

    /// Add a source starting at clock time `at` (seconds).
    ///
    /// A start time in the past begins playback immediately.
    pub fn add(&mut self, samples: &[f32], sample_rate: u32, at: f64) -> Option<SourceId> {
        if !self.connected {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        let half_frame = 0.5 / self.device_rate as f64;
        let requested = match self.tail {
            Some((end, end_frame)) if (at - end).abs() < half_frame => end_frame,
            _ => (at.max(0.0) * self.device_rate as f64).round() as u64,
        };
        let start_frame = requested.max(self.frames_rendered);

        let voice = Voice {
            id,
            samples: resample(samples, sample_rate, self.device_rate),
            start_frame,
        };
        let duration = samples.len() as f64 / sample_rate.max(1) as f64;
        self.tail = Some((at + duration, voice.end_frame()));
        self.voices.push(voice);
        Some(id)
    }

    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
        self.voices.clear();
        self.tail = None;
    }

    pub fn active_sources(&self) -> usize {
        self.voices.len()
    }

    /// Render `out.len() / channels` frames, duplicating mono into every channel.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let t = self.frames_rendered + i as u64;
            let mut sum = 0.0f32;
            for voice in &self.voices {
                if t >= voice.start_frame && t < voice.end_frame() {
                    sum += voice.samples[(t - voice.start_frame) as usize];
                }
            }
            let value = sum.clamp(-1.0, 1.0);
            for sample in frame.iter_mut() {
                *sample = value;
            }
        }

        self.frames_rendered += frames as u64;
        let now = self.frames_rendered;
        self.voices.retain(|v| v.end_frame() > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_only_with_rendering() {
        let mut mixer = Mixer::new(100);
        assert_eq!(mixer.current_time(), 0.0);

        let mut out = vec![0.0; 50];
        mixer.render(&mut out, 1);
        assert!((mixer.current_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sources_play_at_their_start_time() {
        let mut mixer = Mixer::new(10);
        mixer.add(&[0.5; 5], 10, 0.2).unwrap();

        let mut out = vec![0.0; 10];
        mixer.render(&mut out, 1);
        assert_eq!(&out[..2], &[0.0, 0.0]);
        assert_eq!(&out[2..7], &[0.5; 5]);
        assert_eq!(&out[7..], &[0.0; 3]);
        assert_eq!(mixer.active_sources(), 0);
    }

    #[test]
    fn overlapping_sources_are_summed_and_clamped() {
        let mut mixer = Mixer::new(10);
        mixer.add(&[0.75; 4], 10, 0.0).unwrap();
        mixer.add(&[0.75; 4], 10, 0.0).unwrap();

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![1.0; 4]);
    }

    #[test]
    fn mono_is_duplicated_across_channels() {
        let mut mixer = Mixer::new(10);
        mixer.add(&[0.25, -0.25], 10, 0.0).unwrap();

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 2);
        assert_eq!(out, vec![0.25, 0.25, -0.25, -0.25]);
    }

    #[test]
    fn past_start_times_begin_immediately() {
        let mut mixer = Mixer::new(10);
        let mut out = vec![0.0; 10];
        mixer.render(&mut out, 1);

        mixer.add(&[0.5; 2], 10, 0.0).unwrap();
        let mut out = vec![0.0; 2];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn back_to_back_chunks_are_contiguous_after_resampling() {
        // 1001 samples at 24kHz is not a whole number of 44.1kHz frames
        let mut mixer = Mixer::new(44100);
        let mut at = 0.0;
        for _ in 0..10 {
            mixer.add(&[0.5; 1001], 24000, at).unwrap();
            at += 1001.0 / 24000.0;
        }

        for pair in mixer.voices.windows(2) {
            assert_eq!(pair[1].start_frame, pair[0].end_frame());
        }

        let total = mixer.voices.last().unwrap().end_frame() as usize;
        let mut out = vec![0.0; total];
        mixer.render(&mut out, 1);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn removed_and_disconnected_sources_are_silent() {
        let mut mixer = Mixer::new(10);
        let id = mixer.add(&[0.5; 4], 10, 0.0).unwrap();
        assert!(mixer.remove(id));
        assert!(!mixer.remove(id));

        mixer.add(&[0.5; 4], 10, 0.0).unwrap();
        mixer.disconnect();
        assert_eq!(mixer.active_sources(), 0);
        assert!(mixer.add(&[0.5; 4], 10, 0.0).is_none());

        let mut out = vec![1.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0; 4]);
    }
}
