//! Integration tests for the session controller
//!
//! The controller is driven end to end against in-memory fakes: an audio
//! backend with a hand-advanced playback clock, a transport that records every
//! outbound message and lets the test inject inbound events, and a scripted
//! content generator. No devices, network or API key are needed.
//!
//! ```bash
//! cargo test --test session_integration
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use duplex_voice::audio::{
    AudioBackend, AudioChunk, AudioError, CaptureContext, Microphone, OutputSink, SourceId,
};
use duplex_voice::error::ErrorKind;
use duplex_voice::history::{ContentType, Role};
use duplex_voice::live::{
    ChannelEvent, ChannelHandle, ClientMessage, FunctionCall, InboundEvent, LiveError, LiveSender,
    SessionConfig, Transport,
};
use duplex_voice::session::{SessionController, SessionServices, Snapshot};
use duplex_voice::settings::AppSettings;
use duplex_voice::state_machine::SessionState;
use duplex_voice::tools::{ContentGenerator, GeneratedImage, GenerationError};

const WAIT: Duration = Duration::from_secs(3);

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeOutput {
    clock: Mutex<f64>,
    /// (start time, duration) of every started source
    started: Mutex<Vec<(f64, f64)>>,
    next_id: AtomicU64,
    stopped: AtomicUsize,
    closed: AtomicBool,
}

impl FakeOutput {
    fn set_clock(&self, t: f64) {
        *self.clock.lock().unwrap() = t;
    }

    fn started(&self) -> Vec<(f64, f64)> {
        self.started.lock().unwrap().clone()
    }
}

impl OutputSink for FakeOutput {
    fn resume(&self) -> Result<(), AudioError> {
        Ok(())
    }

    fn current_time(&self) -> f64 {
        *self.clock.lock().unwrap()
    }

    fn start_source(
        &self,
        samples: Arc<[f32]>,
        sample_rate: u32,
        at: f64,
    ) -> Result<SourceId, AudioError> {
        if self.is_closed() {
            return Err(AudioError::ContextClosed);
        }
        let duration = samples.len() as f64 / sample_rate as f64;
        self.started.lock().unwrap().push((at, duration));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn stop_source(&self, _id: SourceId) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnect(&self) {}

    fn close(&self) -> Result<(), AudioError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeMic {
    frames: Option<mpsc::Receiver<Vec<f32>>>,
    stopped: Arc<AtomicBool>,
}

impl Microphone for FakeMic {
    fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.frames.take()
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct FakeCapture {
    audio: Arc<AudioShared>,
    closed: bool,
}

impl CaptureContext for FakeCapture {
    fn resume(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn acquire_microphone(&mut self, frame_size: usize) -> Result<Box<dyn Microphone>, AudioError> {
        if self.audio.deny_microphone {
            return Err(AudioError::PermissionDenied("Permission denied".to_string()));
        }
        assert_eq!(frame_size, 4096);
        let (tx, rx) = mpsc::channel(8);
        *self.audio.frames.lock().unwrap() = Some(tx);
        Ok(Box::new(FakeMic {
            frames: Some(rx),
            stopped: self.audio.mic_stopped.clone(),
        }))
    }

    fn close(&mut self) -> Result<(), AudioError> {
        self.closed = true;
        self.audio.capture_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Default)]
struct AudioShared {
    output: Arc<FakeOutput>,
    deny_microphone: bool,
    frames: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    mic_stopped: Arc<AtomicBool>,
    capture_closed: AtomicBool,
}

struct FakeAudio(Arc<AudioShared>);

impl AudioBackend for FakeAudio {
    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputSink>, AudioError> {
        assert_eq!(sample_rate, 24000);
        Ok(self.0.output.clone())
    }

    fn open_capture(&self, sample_rate: u32) -> Result<Box<dyn CaptureContext>, AudioError> {
        assert_eq!(sample_rate, 16000);
        Ok(Box::new(FakeCapture {
            audio: self.0.clone(),
            closed: false,
        }))
    }
}

#[derive(Default)]
struct FakeTransport {
    opens: AtomicUsize,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    events: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
}

impl FakeTransport {
    fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    async fn inject(&self, event: ChannelEvent) {
        let events = self.events.lock().unwrap().clone();
        events
            .expect("channel not open")
            .send(event)
            .await
            .expect("controller stopped listening");
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        config: &SessionConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<ChannelHandle, LiveError> {
        assert_eq!(config.tools.len(), 2);
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.events.lock().unwrap() = Some(events);

        let (sender, mut outbound) = LiveSender::channel(64);
        let cancel = CancellationToken::new();
        let sent = self.sent.clone();
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = outbound.recv() => match msg {
                        Some(msg) => sent.lock().unwrap().push(msg),
                        None => break,
                    },
                }
            }
        });
        Ok(ChannelHandle::new(sender, cancel, vec![writer]))
    }
}

#[derive(Default)]
struct FakeGenerator {
    fail: bool,
}

#[async_trait]
impl ContentGenerator for FakeGenerator {
    async fn generate_content(&self, prompt: &str) -> Result<String, GenerationError> {
        if self.fail {
            return Err(GenerationError::ApiError {
                status: 500,
                message: "backend unavailable".to_string(),
            });
        }
        Ok(format!("Here is {}", prompt))
    }

    async fn generate_image(&self, _prompt: &str) -> Result<GeneratedImage, GenerationError> {
        if self.fail {
            return Err(GenerationError::EmptyResponse("no image".to_string()));
        }
        Ok(GeneratedImage {
            mime_type: "image/png".to_string(),
            data: "iVBORw0KGgo=".to_string(),
        })
    }

    async fn synthesize_speech(&self, _text: &str) -> Result<AudioChunk, GenerationError> {
        Err(GenerationError::NetworkError("offline".to_string()))
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    controller: SessionController,
    audio: Arc<AudioShared>,
    transport: Arc<FakeTransport>,
}

fn harness_with(audio: AudioShared, generator: FakeGenerator) -> Harness {
    let audio = Arc::new(audio);
    let transport = Arc::new(FakeTransport::default());
    let settings = AppSettings {
        speaking_poll_ms: 10,
        ..AppSettings::default()
    };
    let controller = SessionController::spawn(SessionServices {
        audio: Arc::new(FakeAudio(audio.clone())),
        transport: transport.clone(),
        generator: Arc::new(generator),
        settings,
    });
    Harness {
        controller,
        audio,
        transport,
    }
}

fn harness() -> Harness {
    harness_with(AudioShared::default(), FakeGenerator::default())
}

impl Harness {
    async fn wait_for(&self, what: &str, predicate: impl FnMut(&Snapshot) -> bool) -> Snapshot {
        let mut rx = self.controller.subscribe();
        let result = tokio::time::timeout(WAIT, rx.wait_for(predicate)).await;
        match result {
            Ok(Ok(snapshot)) => snapshot.clone(),
            Ok(Err(_)) => panic!("controller stopped while waiting for {}", what),
            Err(_) => panic!(
                "timed out waiting for {}; last snapshot: {:?}",
                what,
                self.controller.snapshot()
            ),
        }
    }

    async fn connect(&self) {
        self.controller.start(false).await;
        self.wait_for("connected", |s| s.state == SessionState::Connected)
            .await;
    }

    async fn wait_sent(&self, what: &str, mut predicate: impl FnMut(&[ClientMessage]) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if predicate(&self.transport.sent()) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}: {:?}", what, self.transport.sent());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Every (id, result) tool response sent so far
    fn tool_responses(&self) -> Vec<(String, String)> {
        self.transport
            .sent()
            .into_iter()
            .filter_map(|msg| match msg {
                ClientMessage::ToolResponse(r) => Some(r.function_responses),
                _ => None,
            })
            .flatten()
            .map(|r| (r.id, r.response.result))
            .collect()
    }
}

fn tool_call(id: &str, name: &str, args: serde_json::Value) -> FunctionCall {
    FunctionCall {
        id: id.to_string(),
        name: name.to_string(),
        args,
    }
}

fn audio_chunk(samples: usize) -> ChannelEvent {
    ChannelEvent::Message(InboundEvent::Audio {
        data: duplex_voice::audio::pcm::encode_base64(&vec![0.1; samples]),
        mime_type: "audio/pcm;rate=24000".to_string(),
    })
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn start_is_idempotent_while_live() {
    let h = harness();
    assert_eq!(h.controller.state(), SessionState::Idle);

    h.controller.start(false).await;
    h.controller.start(false).await;
    h.wait_for("connected", |s| s.state == SessionState::Connected)
        .await;

    h.controller.start(true).await;
    // Give the loop a moment to (not) act on the third start
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.state(), SessionState::Connected);
    assert!(h.controller.error().is_none());
}

#[tokio::test]
async fn permission_denied_fails_setup_and_releases_everything() {
    let h = harness_with(
        AudioShared {
            deny_microphone: true,
            ..AudioShared::default()
        },
        FakeGenerator::default(),
    );

    h.controller.start(false).await;
    let snapshot = h
        .wait_for("error", |s| s.state == SessionState::Error)
        .await;

    let error = snapshot.error.expect("error should be held");
    assert_eq!(error.kind, ErrorKind::PermissionDenied);
    assert_eq!(error.title, "Microphone access required");
    assert_eq!(error.steps.len(), 3);

    // The failed attempt is on record
    assert_eq!(snapshot.errors.len(), 1);
    assert_eq!(snapshot.errors[0].title, "Microphone access required");
    assert_eq!(snapshot.attempts.len(), 1);
    assert_eq!(
        snapshot.attempts[0].error.as_deref(),
        Some("Microphone access required")
    );
    assert_eq!(snapshot.attempts[0].connect_ms, None);

    // The channel was never opened and every audio resource is gone
    assert_eq!(h.transport.opens.load(Ordering::SeqCst), 0);
    assert!(h.audio.output.is_closed());
    assert!(h.audio.capture_closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn clean_close_returns_to_idle() {
    let h = harness();
    h.connect().await;

    h.transport
        .inject(ChannelEvent::Closed {
            clean: true,
            reason: "bye".to_string(),
        })
        .await;
    let snapshot = h.wait_for("idle", |s| s.state == SessionState::Idle).await;

    assert!(snapshot.error.is_none());
    assert!(h.audio.output.is_closed());
    assert!(h.audio.mic_stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unclean_close_is_a_connection_error_until_cleared() {
    let h = harness();
    h.connect().await;

    h.transport
        .inject(ChannelEvent::Closed {
            clean: false,
            reason: "Stream ended".to_string(),
        })
        .await;
    let snapshot = h
        .wait_for("error", |s| s.state == SessionState::Error)
        .await;
    assert_eq!(
        snapshot.error.map(|e| e.kind),
        Some(ErrorKind::ConnectionFailed)
    );
    assert!(h.audio.output.is_closed());

    // Dismissing the error does not leave the error state
    h.controller.clear_error().await;
    let snapshot = h.wait_for("cleared", |s| s.error.is_none()).await;
    assert_eq!(snapshot.state, SessionState::Error);
}

#[tokio::test]
async fn failed_greeting_does_not_affect_the_session() {
    let h = harness();

    h.controller.start(true).await;
    h.wait_for("connected", |s| s.state == SessionState::Connected)
        .await;

    assert!(h.controller.error().is_none());
    assert!(h.audio.output.started().is_empty());
}

#[tokio::test]
async fn shutdown_releases_the_live_session() {
    let h = harness();
    h.connect().await;

    h.controller.shutdown().await;

    assert!(h.audio.output.is_closed());
    assert!(h.audio.capture_closed.load(Ordering::SeqCst));
    assert!(h.audio.mic_stopped.load(Ordering::SeqCst));
}

// ============================================================================
// Audio
// ============================================================================

#[tokio::test]
async fn captured_frames_are_streamed_as_realtime_input() {
    let h = harness();
    h.connect().await;

    let frames = h.audio.frames.lock().unwrap().clone().expect("microphone acquired");
    frames.send(vec![0.25; 4096]).await.unwrap();

    h.wait_sent("realtime input", |sent| {
        sent.iter().any(|msg| match msg {
            ClientMessage::RealtimeInput(input) => {
                input.media_chunks.len() == 1
                    && input.media_chunks[0].mime_type == "audio/pcm;rate=16000"
            }
            _ => false,
        })
    })
    .await;
}

#[tokio::test]
async fn playback_is_gapless_and_speaking_follows_the_clock() {
    let h = harness();
    h.connect().await;
    h.audio.output.set_clock(0.5);

    // 0.1s each at 24kHz
    h.transport.inject(audio_chunk(2400)).await;
    h.transport.inject(audio_chunk(2400)).await;
    h.wait_for("speaking", |s| s.speaking).await;

    let deadline = tokio::time::Instant::now() + WAIT;
    while h.audio.output.started().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "chunks not scheduled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let started = h.audio.output.started();
    assert!((started[0].0 - 0.5).abs() < 1e-9);
    assert!((started[1].0 - 0.6).abs() < 1e-9);

    // Still ahead of the clock
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.controller.is_speaking());

    h.audio.output.set_clock(0.7);
    h.wait_for("speaking stopped", |s| !s.speaking).await;
}

#[tokio::test]
async fn in_flight_audio_is_stopped_on_close() {
    let h = harness();
    h.connect().await;

    h.transport.inject(audio_chunk(24000)).await;
    h.wait_for("speaking", |s| s.speaking).await;

    h.transport
        .inject(ChannelEvent::Closed {
            clean: true,
            reason: String::new(),
        })
        .await;
    let snapshot = h.wait_for("idle", |s| s.state == SessionState::Idle).await;

    assert!(!snapshot.speaking);
    assert_eq!(h.audio.output.stopped.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Tool calls
// ============================================================================

#[tokio::test]
async fn image_tool_call_updates_history_and_answers_once() {
    let h = harness();
    h.connect().await;

    h.transport
        .inject(ChannelEvent::Message(InboundEvent::ToolCall(vec![tool_call(
            "call-1",
            "generateImage",
            json!({ "prompt": "a red bicycle" }),
        )])))
        .await;

    let snapshot = h
        .wait_for("image in history", |s| s.history.len() == 2 && !s.thinking)
        .await;

    // Newest first
    let image = &snapshot.history[0];
    assert_eq!(image.role, Role::Model);
    assert_eq!(image.content_type, ContentType::Image);
    assert_eq!(image.text, "data:image/png;base64,iVBORw0KGgo=");

    let request = &snapshot.history[1];
    assert_eq!(request.role, Role::User);
    assert_eq!(request.text, "Generate an image: a red bicycle");

    h.wait_sent("tool response", |sent| {
        sent.iter().any(|m| matches!(m, ClientMessage::ToolResponse(_)))
    })
    .await;
    assert_eq!(
        h.tool_responses(),
        vec![(
            "call-1".to_string(),
            "Image generated and shown to the user.".to_string()
        )]
    );
}

#[tokio::test]
async fn failed_and_unknown_tools_each_get_one_response() {
    let h = harness_with(AudioShared::default(), FakeGenerator { fail: true });
    h.connect().await;

    h.transport
        .inject(ChannelEvent::Message(InboundEvent::ToolCall(vec![
            tool_call("a", "generateContent", json!({ "prompt": "a haiku" })),
            tool_call("b", "launchRockets", json!({})),
        ])))
        .await;

    h.wait_sent("two tool responses", |sent| {
        sent.iter()
            .filter(|m| matches!(m, ClientMessage::ToolResponse(_)))
            .count()
            == 2
    })
    .await;

    let responses = h.tool_responses();
    assert_eq!(responses[0].0, "a");
    assert!(responses[0].1.starts_with("Failed to generate content:"));
    assert_eq!(responses[1], ("b".to_string(), "Unknown tool: launchRockets".to_string()));

    let snapshot = h
        .wait_for("batch finished", |s| s.history.len() == 2 && !s.thinking)
        .await;
    assert_eq!(
        snapshot.history[0].text,
        "Sorry, I couldn't generate that content. Please try again."
    );
    assert_eq!(snapshot.history[1].text, "Generate content: a haiku");
    assert_eq!(snapshot.state, SessionState::Connected);
}
