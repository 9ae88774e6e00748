//! Microphone to duplex channel forwarding
//!
//! ```text
//! Audio Thread (sync)              Tokio Runtime (async)
//! ┌──────────────────┐             ┌────────────────────────┐
//! │ cpal callback    │──channel──▶ │ AudioCapturePipe::run()│
//! │ try_send(frame)  │             │   ├─ PCM16 + base64    │
//! └──────────────────┘             │   └─ try_send to WS    │
//!                                  └────────────────────────┘
//! ```
//!
//! Delivery is at-most-once: a frame that cannot be queued right away is
//! counted and dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::live::LiveSender;
use crate::metrics::CaptureCounters;

pub struct AudioCapturePipe {
    frames: mpsc::Receiver<Vec<f32>>,
    sender: LiveSender,
    sample_rate: u32,
    counters: Arc<CaptureCounters>,
}

impl AudioCapturePipe {
    pub fn new(
        frames: mpsc::Receiver<Vec<f32>>,
        sender: LiveSender,
        sample_rate: u32,
        counters: Arc<CaptureCounters>,
    ) -> Self {
        Self {
            frames,
            sender,
            sample_rate,
            counters,
        }
    }

    /// Forward frames until the microphone stops or `cancel` fires.
    ///
    /// Returns the number of frames sent.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        log::info!("AudioCapturePipe: forwarding at {}Hz", self.sample_rate);
        let mut sent = 0u64;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            self.counters.record_captured();

            if self.sender.is_closed() {
                self.counters.record_dropped();
                continue;
            }

            match self.sender.try_send_audio(&frame, self.sample_rate) {
                Ok(()) => {
                    sent += 1;
                    self.counters.record_sent();
                    if sent % 50 == 0 {
                        log::debug!("AudioCapturePipe: sent {} chunks", sent);
                    }
                }
                Err(e) => {
                    self.counters.record_dropped();
                    log::trace!("AudioCapturePipe: dropped frame: {}", e);
                }
            }
        }

        log::info!(
            "AudioCapturePipe: stopped, {} chunks sent, {} dropped",
            sent,
            self.counters.dropped()
        );
        sent
    }
}
