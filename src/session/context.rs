//! Resources owned by one session attempt
//!
//! Everything a live session holds (audio contexts, microphone, channel and
//! the tasks bridging them) lives in one `SessionContext`. Releasing it tears
//! all of it down in a fixed order; releasing twice is a no-op.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{AudioCapturePipe, CaptureContext, Microphone, OutputSink};
use crate::live::{ChannelHandle, LiveSender};
use crate::metrics::CaptureCounters;

struct CaptureTask {
    cancel: CancellationToken,
    task: JoinHandle<u64>,
}

pub struct SessionContext {
    attempt_id: Uuid,
    output: Option<Arc<dyn OutputSink>>,
    capture: Option<Box<dyn CaptureContext>>,
    microphone: Option<Box<dyn Microphone>>,
    channel: Option<ChannelHandle>,
    /// Relays channel events into the controller mailbox
    forwarder: Option<JoinHandle<()>>,
    capture_task: Option<CaptureTask>,
    released: bool,
}

impl SessionContext {
    pub fn new(attempt_id: Uuid) -> Self {
        Self {
            attempt_id,
            output: None,
            capture: None,
            microphone: None,
            channel: None,
            forwarder: None,
            capture_task: None,
            released: false,
        }
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn set_output(&mut self, output: Arc<dyn OutputSink>) {
        self.output = Some(output);
    }

    pub fn set_capture(&mut self, capture: Box<dyn CaptureContext>) {
        self.capture = Some(capture);
    }

    pub fn set_microphone(&mut self, microphone: Box<dyn Microphone>) {
        self.microphone = Some(microphone);
    }

    pub fn set_channel(&mut self, channel: ChannelHandle) {
        self.channel = Some(channel);
    }

    pub fn set_forwarder(&mut self, forwarder: JoinHandle<()>) {
        if let Some(old) = self.forwarder.replace(forwarder) {
            old.abort();
        }
    }

    pub fn output(&self) -> Option<&Arc<dyn OutputSink>> {
        self.output.as_ref()
    }

    pub fn capture_mut(&mut self) -> Option<&mut (dyn CaptureContext + 'static)> {
        self.capture.as_deref_mut()
    }

    pub fn sender(&self) -> Option<LiveSender> {
        self.channel.as_ref().map(|c| c.sender())
    }

    /// Start forwarding microphone frames onto the channel.
    ///
    /// Frames already queued are discarded. Returns false if there is no microphone stream or channel to wire.
    pub fn wire_capture(&mut self, sample_rate: u32, counters: Arc<CaptureCounters>) -> bool {
        if self.released || self.capture_task.is_some() {
            return false;
        }
        let Some(sender) = self.sender() else {
            return false;
        };
        let Some(mut frames) = self.microphone.as_mut().and_then(|m| m.take_frames()) else {
            log::warn!("Session {}: no microphone frames to forward", self.attempt_id);
            return false;
        };

        // Audio captured before the channel was ready is never sent
        let mut stale = 0usize;
        while frames.try_recv().is_ok() {
            counters.record_captured();
            counters.record_dropped();
            stale += 1;
        }
        if stale > 0 {
            log::debug!(
                "Session {}: dropped {} frames captured before the channel opened",
                self.attempt_id,
                stale
            );
        }

        let cancel = CancellationToken::new();
        let pipe = AudioCapturePipe::new(frames, sender, sample_rate, counters);
        let task = tokio::spawn(pipe.run(cancel.clone()));
        self.capture_task = Some(CaptureTask { cancel, task });
        true
    }

    /// Release every resource. Never fails; faults are logged and swallowed.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(capture) = self.capture_task.take() {
            capture.cancel.cancel();
            capture.task.abort();
        }

        if let Some(output) = self.output.take() {
            output.disconnect();
            if !output.is_closed() {
                if let Err(e) = output.close() {
                    log::debug!("Session {}: closing output: {}", self.attempt_id, e);
                }
            }
        }

        if let Some(mut capture) = self.capture.take() {
            if !capture.is_closed() {
                if let Err(e) = capture.close() {
                    log::debug!("Session {}: closing capture: {}", self.attempt_id, e);
                }
            }
        }

        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }

        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        log::info!("Session {}: resources released", self.attempt_id);
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, SourceId};
    use crate::live::ClientMessage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingSink {
        closes: AtomicUsize,
        disconnected: AtomicBool,
        closed: AtomicBool,
    }

    impl OutputSink for CountingSink {
        fn resume(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn current_time(&self) -> f64 {
            0.0
        }
        fn start_source(&self, _: Arc<[f32]>, _: u32, _: f64) -> Result<SourceId, AudioError> {
            Ok(0)
        }
        fn stop_source(&self, _: SourceId) {}
        fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
        fn close(&self) -> Result<(), AudioError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Err(AudioError::ContextClosed)
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct StubMic {
        frames: Option<mpsc::Receiver<Vec<f32>>>,
        stopped: Arc<AtomicBool>,
    }

    impl Microphone for StubMic {
        fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
            self.frames.take()
        }
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn release_is_idempotent_and_swallows_faults() {
        let sink = Arc::new(CountingSink::default());
        let stopped = Arc::new(AtomicBool::new(false));
        let (_frame_tx, frame_rx) = mpsc::channel(1);

        let mut ctx = SessionContext::new(Uuid::new_v4());
        ctx.set_output(sink.clone());
        ctx.set_microphone(Box::new(StubMic {
            frames: Some(frame_rx),
            stopped: stopped.clone(),
        }));

        ctx.release();
        ctx.release();
        drop(ctx);

        assert!(sink.disconnected.load(Ordering::SeqCst));
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn wire_capture_needs_channel_and_microphone() {
        let mut ctx = SessionContext::new(Uuid::new_v4());
        assert!(!ctx.wire_capture(16000, Arc::new(CaptureCounters::default())));

        let (sender, mut outbound) = LiveSender::channel(4);
        ctx.set_channel(ChannelHandle::new(sender, CancellationToken::new(), Vec::new()));
        let (frame_tx, frame_rx) = mpsc::channel(4);
        ctx.set_microphone(Box::new(StubMic {
            frames: Some(frame_rx),
            stopped: Arc::new(AtomicBool::new(false)),
        }));

        assert!(ctx.wire_capture(16000, Arc::new(CaptureCounters::default())));
        // Only once per attempt
        assert!(!ctx.wire_capture(16000, Arc::new(CaptureCounters::default())));

        frame_tx.send(vec![0.0; 8]).await.unwrap();
        assert!(outbound.recv().await.is_some());

        ctx.release();
    }

    #[tokio::test]
    async fn frames_captured_before_wiring_are_dropped() {
        let mut ctx = SessionContext::new(Uuid::new_v4());
        let (frame_tx, frame_rx) = mpsc::channel(8);
        ctx.set_microphone(Box::new(StubMic {
            frames: Some(frame_rx),
            stopped: Arc::new(AtomicBool::new(false)),
        }));

        // Microphone is live while the channel is still opening
        for _ in 0..5 {
            frame_tx.send(vec![0.9; 8]).await.unwrap();
        }

        let (sender, mut outbound) = LiveSender::channel(8);
        ctx.set_channel(ChannelHandle::new(sender, CancellationToken::new(), Vec::new()));
        let counters = Arc::new(CaptureCounters::default());
        assert!(ctx.wire_capture(16000, counters.clone()));
        assert_eq!(counters.dropped(), 5);

        let fresh = vec![0.1; 8];
        frame_tx.send(fresh.clone()).await.unwrap();
        assert_eq!(
            outbound.recv().await,
            Some(ClientMessage::audio_input(&fresh, 16000))
        );
        assert!(outbound.try_recv().is_err());
        assert_eq!(counters.sent(), 1);

        ctx.release();
    }
}
