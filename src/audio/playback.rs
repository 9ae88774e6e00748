//! Gapless playback scheduling
//!
//! Every inbound chunk is placed at `max(next_start_time, clock)`, which
//! serializes back-to-back chunks and never schedules into the past after a
//! stall. The scheduler also derives the "speaking" flag: true from the first
//! chunk of a burst until the clock catches up with the cursor.

use std::collections::BTreeMap;

use super::pcm::AudioChunk;
use super::{AudioError, OutputSink, SourceId};

/// Default tolerance when deciding that playback has caught up (seconds)
pub const DEFAULT_SPEAKING_EPSILON: f64 = 0.05;

/// Result of scheduling one chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
    /// True when this chunk started a new speaking burst
    pub burst_started: bool,
}

#[derive(Debug, Clone, Copy)]
struct LiveSource {
    end_time: f64,
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    live: BTreeMap<SourceId, LiveSource>,
    speaking: bool,
    epsilon: f64,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SPEAKING_EPSILON)
    }
}

impl PlaybackScheduler {
    pub fn new(epsilon: f64) -> Self {
        Self {
            next_start_time: 0.0,
            live: BTreeMap::new(),
            speaking: false,
            epsilon: epsilon.max(0.0),
        }
    }

    /// Schedule `chunk` on `sink`, advancing the cursor.
    ///
    /// The clock read, the start computation and the cursor update happen in
    /// one call, so two chunks can never interleave their updates.
    pub fn schedule(
        &mut self,
        sink: &dyn OutputSink,
        chunk: &AudioChunk,
    ) -> Result<Scheduled, AudioError> {
        if sink.is_closed() {
            return Err(AudioError::ContextClosed);
        }

        let now = sink.current_time();
        self.prune(now);

        let start_time = self.next_start_time.max(now);
        let duration = chunk.duration();
        let id = sink.start_source(chunk.samples.clone(), chunk.sample_rate, start_time)?;

        self.next_start_time = start_time + duration;
        self.live.insert(
            id,
            LiveSource {
                end_time: start_time + duration,
            },
        );

        let burst_started = !self.speaking;
        self.speaking = true;

        Ok(Scheduled {
            id,
            start_time,
            duration,
            burst_started,
        })
    }

    /// Compare the clock with the cursor.
    ///
    /// Returns true exactly once per burst, when speaking flips to false.
    pub fn poll(&mut self, now: f64) -> bool {
        self.prune(now);
        if self.speaking && self.next_start_time - now <= self.epsilon {
            self.speaking = false;
            return true;
        }
        false
    }

    /// Stop every in-flight source and reset the cursor to 0.
    pub fn reset(&mut self, sink: Option<&dyn OutputSink>) {
        if let Some(sink) = sink {
            for id in self.live.keys() {
                sink.stop_source(*id);
            }
        }
        if !self.live.is_empty() {
            log::debug!("Playback: stopped {} in-flight sources", self.live.len());
        }
        self.live.clear();
        self.next_start_time = 0.0;
        self.speaking = false;
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn live_sources(&self) -> usize {
        self.live.len()
    }

    /// Drop sources that have finished playing.
    fn prune(&mut self, now: f64) {
        self.live.retain(|_, source| source.end_time > now);
    }
}
