//! Session controller
//!
//! One tokio task owns every piece of mutable session state: the lifecycle
//! state, the attempt's [`SessionContext`], the playback scheduler, the
//! history and the thinking/speaking flags. Everything else (setup, the
//! channel reader, the speaking poll, tool batches) runs in spawned tasks
//! that report back through the controller's mailbox, so state changes are
//! applied strictly one at a time.
//!
//! ```text
//! start() ──▶ mailbox ──▶ reduce() ──▶ effects ──▶ setup task ──▶ Established
//!                ▲                                                    │
//!                ├── channel forwarder ◀── duplex channel ◀───────────┘
//!                ├── speaking poll
//!                └── tool updates ◀── ToolCallDispatcher
//! ```

mod context;

pub use context::SessionContext;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::pcm::{decode_base64, sample_rate_from_mime};
use crate::audio::{AudioBackend, OutputSink, PlaybackScheduler};
use crate::error::{AppError, Fault};
use crate::history::{History, Message};
use crate::live::{ChannelEvent, InboundEvent, LiveError, Transport};
use crate::metrics::{AttemptMetrics, CaptureCounters, ErrorRecord, MetricsCollector, MetricsSummary};
use crate::settings::AppSettings;
use crate::state_machine::{reduce, Effect, Event, Phase, SessionState, State};
use crate::tools::{ContentGenerator, ToolCallDispatcher, ToolUpdate};

/// Capacity of the controller mailbox
const MAILBOX_CAPACITY: usize = 64;

/// Capacity of the per-attempt channel event queue
const CHANNEL_EVENT_CAPACITY: usize = 128;

/// Collaborators the controller drives
pub struct SessionServices {
    pub audio: Arc<dyn AudioBackend>,
    pub transport: Arc<dyn Transport>,
    pub generator: Arc<dyn ContentGenerator>,
    pub settings: AppSettings,
}

/// Immutable view of everything a caller can observe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub state: SessionState,
    pub error: Option<AppError>,
    /// Newest first
    pub history: Vec<Message>,
    pub thinking: bool,
    pub speaking: bool,
    pub metrics: MetricsSummary,
    /// Finished attempts, newest first
    pub attempts: Vec<AttemptMetrics>,
    /// Classified errors, newest first
    pub errors: Vec<ErrorRecord>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            error: None,
            history: Vec::new(),
            thinking: false,
            speaking: false,
            metrics: MetricsSummary::default(),
            attempts: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Mailbox message for the controller loop
enum Signal {
    Lifecycle(Event),
    /// Setup finished; the context and its channel events belong to `id`
    Established {
        id: Uuid,
        ctx: SessionContext,
        events: mpsc::Receiver<ChannelEvent>,
    },
    Channel {
        id: Uuid,
        event: ChannelEvent,
    },
    SpeakingPoll {
        id: Uuid,
    },
    Exit,
}

/// Caller-facing handle. Cheap getters read the latest published snapshot.
pub struct SessionController {
    mailbox: mpsc::Sender<Signal>,
    snapshot: watch::Receiver<Snapshot>,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Spawn the controller loop on the current tokio runtime.
    pub fn spawn(services: SessionServices) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let runtime = SessionRuntime::new(Arc::new(services), mailbox_tx.clone(), tool_tx, snapshot_tx);
        let task = tokio::spawn(runtime.run(mailbox_rx, tool_rx));

        Self {
            mailbox: mailbox_tx,
            snapshot: snapshot_rx,
            task: Some(task),
        }
    }

    /// Begin a session. Ignored while one is connecting or connected.
    pub async fn start(&self, play_greeting: bool) {
        self.send(Event::Start { play_greeting }).await;
    }

    /// Dismiss the held error. The state is left unchanged.
    pub async fn clear_error(&self) {
        self.send(Event::ClearError).await;
    }

    async fn send(&self, event: Event) {
        if self.mailbox.send(Signal::Lifecycle(event)).await.is_err() {
            log::warn!("Session loop is not running");
        }
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn history(&self) -> Vec<Message> {
        self.snapshot.borrow().history.clone()
    }

    pub fn error(&self) -> Option<AppError> {
        self.snapshot.borrow().error.clone()
    }

    pub fn is_thinking(&self) -> bool {
        self.snapshot.borrow().thinking
    }

    pub fn is_speaking(&self) -> bool {
        self.snapshot.borrow().speaking
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that wakes on every published change
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Release every resource and stop the loop.
    pub async fn shutdown(mut self) {
        let _ = self.mailbox.send(Signal::Exit).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Session loop ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.mailbox.try_send(Signal::Exit);
        }
    }
}

/// The single writer
struct SessionRuntime {
    services: Arc<SessionServices>,
    state: State,
    ctx: Option<SessionContext>,
    scheduler: PlaybackScheduler,
    history: History,
    /// Tool batches in flight
    thinking: u32,
    /// Set by cleanup; a late open for the torn-down attempt is dropped
    channel_closed: bool,
    speaking_poll: Option<JoinHandle<()>>,
    metrics: MetricsCollector,
    capture_counters: Arc<CaptureCounters>,
    mailbox: mpsc::Sender<Signal>,
    tool_updates: mpsc::UnboundedSender<ToolUpdate>,
    snapshot: watch::Sender<Snapshot>,
}

impl SessionRuntime {
    fn new(
        services: Arc<SessionServices>,
        mailbox: mpsc::Sender<Signal>,
        tool_updates: mpsc::UnboundedSender<ToolUpdate>,
        snapshot: watch::Sender<Snapshot>,
    ) -> Self {
        let epsilon = services.settings.speaking_epsilon_secs();
        Self {
            services,
            state: State::default(),
            ctx: None,
            scheduler: PlaybackScheduler::new(epsilon),
            history: History::new(),
            thinking: 0,
            channel_closed: true,
            speaking_poll: None,
            metrics: MetricsCollector::new(),
            capture_counters: Arc::new(CaptureCounters::default()),
            mailbox,
            tool_updates,
            snapshot,
        }
    }

    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<Signal>,
        mut tool_updates: mpsc::UnboundedReceiver<ToolUpdate>,
    ) {
        self.publish();
        log::info!("Session loop started");

        loop {
            tokio::select! {
                signal = mailbox.recv() => match signal {
                    Some(Signal::Exit) | None => {
                        log::info!("Exit requested, shutting down session loop");
                        break;
                    }
                    Some(signal) => self.handle_signal(signal),
                },
                Some(update) = tool_updates.recv() => self.handle_tool_update(update),
            }
        }

        self.cleanup();
        self.publish();
        log::info!("Session loop ended");
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Lifecycle(event) => self.apply(event),
            Signal::Established { id, ctx, events } => self.handle_established(id, ctx, events),
            Signal::Channel { id, event } => self.handle_channel_event(id, event),
            Signal::SpeakingPoll { id } => self.handle_speaking_poll(id),
            Signal::Exit => self.cleanup(),
        }
    }

    /// Run one event through the reducer and execute its effects.
    fn apply(&mut self, event: Event) {
        log::debug!("Received event: {:?}", event);

        let (next, effects) = reduce(&self.state, event);
        if next.session_state() != self.state.session_state() {
            log::info!(
                "State transition: {} -> {}",
                self.state.session_state(),
                next.session_state()
            );
        }
        self.state = next;

        for effect in effects {
            match effect {
                Effect::Cleanup => self.cleanup(),
                Effect::OpenSession { id, play_greeting } => self.open_session(id, play_greeting),
                Effect::WireCapture { id } => self.wire_capture(id),
                Effect::EmitUi => self.publish(),
            }
        }
    }

    fn open_session(&mut self, id: Uuid, play_greeting: bool) {
        self.channel_closed = false;
        self.capture_counters = self.metrics.start_attempt(id);

        let services = self.services.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let mut ctx = SessionContext::new(id);
            match establish(&services, &mut ctx, play_greeting).await {
                Ok(events) => {
                    // A closed mailbox drops the context, which releases it
                    let _ = mailbox.send(Signal::Established { id, ctx, events }).await;
                }
                Err(fault) => {
                    log::warn!("Session {} setup failed: {}", id, fault);
                    ctx.release();
                    let _ = mailbox
                        .send(Signal::Lifecycle(Event::SetupFailed { id, fault }))
                        .await;
                }
            }
        });
    }

    fn handle_established(
        &mut self,
        id: Uuid,
        mut ctx: SessionContext,
        events: mpsc::Receiver<ChannelEvent>,
    ) {
        let expected = self.state.phase == Phase::Connecting { attempt_id: id };
        if !expected || self.channel_closed {
            log::debug!("Dropping late session context for attempt {}", id);
            ctx.release();
            return;
        }

        ctx.set_forwarder(spawn_forwarder(id, events, self.mailbox.clone()));
        self.ctx = Some(ctx);
        self.apply(Event::ChannelOpened { id });
    }

    fn wire_capture(&mut self, id: Uuid) {
        let rate = self.services.settings.input_sample_rate;
        let counters = self.capture_counters.clone();
        if let Some(ctx) = self.ctx.as_mut().filter(|c| c.attempt_id() == id) {
            if ctx.wire_capture(rate, counters) {
                log::info!("Session {}: capture wired to channel", id);
            }
        }
        self.metrics.connected();
    }

    fn handle_channel_event(&mut self, id: Uuid, event: ChannelEvent) {
        if self.state.phase.attempt_id() != Some(id) {
            log::trace!("Ignoring channel event for stale attempt {}", id);
            return;
        }

        match event {
            ChannelEvent::Message(message) => self.handle_inbound(id, message),
            ChannelEvent::Error(e) => {
                log::error!("Session {}: channel error: {}", id, e);
                self.apply(Event::ChannelFailed {
                    id,
                    fault: Fault::from(e),
                });
            }
            ChannelEvent::Closed { clean, reason } => {
                log::info!("Session {}: channel closed ({})", id, reason);
                let fault = (!clean).then(|| Fault::from(LiveError::Disconnected(reason)));
                self.apply(Event::ChannelClosed { id, fault });
            }
        }
    }

    fn handle_inbound(&mut self, id: Uuid, event: InboundEvent) {
        match event {
            InboundEvent::Audio { data, mime_type } => self.schedule_audio(id, &data, &mime_type),
            InboundEvent::ToolCall(calls) => {
                let Some(sender) = self.ctx.as_ref().and_then(|c| c.sender()) else {
                    log::warn!("Session {}: tool call with no open channel", id);
                    return;
                };
                let dispatcher = ToolCallDispatcher::new(
                    self.services.generator.clone(),
                    sender,
                    self.tool_updates.clone(),
                );
                tokio::spawn(async move { dispatcher.dispatch(calls).await });
            }
            InboundEvent::Transcript(text) => log::info!("Model: {}", text),
            InboundEvent::TurnComplete => log::debug!("Session {}: turn complete", id),
            InboundEvent::Interrupted => {
                log::info!("Session {}: model turn interrupted", id)
            }
            InboundEvent::ToolCallCancellation(ids) => {
                log::info!("Session {}: server cancelled tool calls {:?}", id, ids)
            }
            InboundEvent::GoAway { time_left } => {
                log::warn!("Session {}: server going away (time left: {:?})", id, time_left)
            }
            InboundEvent::SetupComplete => log::debug!("Session {}: setup acknowledged", id),
        }
    }

    fn schedule_audio(&mut self, id: Uuid, data: &str, mime_type: &str) {
        let rate =
            sample_rate_from_mime(mime_type).unwrap_or(self.services.settings.output_sample_rate);
        let chunk = match decode_base64(data, rate) {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Session {}: undecodable audio chunk: {}", id, e);
                self.metrics.chunk_rejected();
                return;
            }
        };

        let Some(output) = self.ctx.as_ref().and_then(|c| c.output().cloned()) else {
            log::debug!("Session {}: audio chunk with no output sink", id);
            self.metrics.chunk_rejected();
            return;
        };

        match self.scheduler.schedule(output.as_ref(), &chunk) {
            Ok(scheduled) => {
                log::trace!(
                    "Scheduled {:.3}s chunk at {:.3}",
                    scheduled.duration,
                    scheduled.start_time
                );
                self.metrics.chunk_scheduled(scheduled.duration);
                self.restart_speaking_poll(id);
                if scheduled.burst_started {
                    self.publish();
                }
            }
            Err(e) => {
                log::warn!("Session {}: audio chunk rejected: {}", id, e);
                self.metrics.chunk_rejected();
            }
        }
    }

    fn restart_speaking_poll(&mut self, id: Uuid) {
        self.stop_speaking_poll();
        let period = self.services.settings.speaking_poll_interval();
        let mailbox = self.mailbox.clone();
        self.speaking_poll = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if mailbox.send(Signal::SpeakingPoll { id }).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_speaking_poll(&mut self) {
        if let Some(poll) = self.speaking_poll.take() {
            poll.abort();
        }
    }

    fn handle_speaking_poll(&mut self, id: Uuid) {
        if self.state.phase.attempt_id() != Some(id) {
            return;
        }
        let Some(now) = self.ctx.as_ref().and_then(|c| c.output()).map(|o| o.current_time())
        else {
            return;
        };
        if self.scheduler.poll(now) {
            log::debug!("Session {}: playback caught up, speaking stopped", id);
            self.stop_speaking_poll();
            self.publish();
        }
    }

    fn handle_tool_update(&mut self, update: ToolUpdate) {
        match update {
            ToolUpdate::Thinking(true) => self.thinking += 1,
            ToolUpdate::Thinking(false) => self.thinking = self.thinking.saturating_sub(1),
            ToolUpdate::Append(message) => self.history.push(message),
            ToolUpdate::Completed { id, ok } => {
                log::debug!("Tool call {} finished (ok: {})", id, ok);
                self.metrics.tool_call_finished(ok);
            }
        }
        self.publish();
    }

    /// Tear down the current attempt. Safe to call any number of times.
    fn cleanup(&mut self) {
        self.channel_closed = true;
        self.stop_speaking_poll();

        let output: Option<Arc<dyn OutputSink>> =
            self.ctx.as_ref().and_then(|c| c.output().cloned());
        self.scheduler.reset(output.as_deref());

        if let Some(mut ctx) = self.ctx.take() {
            ctx.release();
        }
        self.metrics.attempt_ended(self.state.error.as_ref());
    }

    fn publish(&self) {
        let snapshot = Snapshot {
            state: self.state.session_state(),
            error: self.state.error.clone(),
            history: self.history.to_vec(),
            thinking: self.thinking > 0,
            speaking: self.scheduler.is_speaking(),
            metrics: self.metrics.get_summary(),
            attempts: self.metrics.get_history(),
            errors: self.metrics.get_errors(),
        };
        log::debug!(
            "Publishing snapshot: {} (thinking: {}, speaking: {}, {} messages)",
            snapshot.state,
            snapshot.thinking,
            snapshot.speaking,
            snapshot.history.len()
        );
        self.snapshot.send_replace(snapshot);
    }
}

/// Steps (a) to (e) of session establishment.
///
/// Every resource is stored in `ctx` as soon as it exists, so a failure at any
/// step leaves the caller with one context to release.
async fn establish(
    services: &SessionServices,
    ctx: &mut SessionContext,
    play_greeting: bool,
) -> Result<mpsc::Receiver<ChannelEvent>, Fault> {
    let settings = &services.settings;

    // (a) audio contexts
    let output = services.audio.open_output(settings.output_sample_rate)?;
    ctx.set_output(output.clone());
    ctx.set_capture(services.audio.open_capture(settings.input_sample_rate)?);

    // (b) resume
    output.resume()?;
    if let Some(capture) = ctx.capture_mut() {
        capture.resume()?;
    }

    // (c) greeting, out of band
    if play_greeting {
        tokio::spawn(play_greeting_once(
            services.generator.clone(),
            output.clone(),
            settings.greeting_text.clone(),
        ));
    }

    // (d) microphone
    if let Some(capture) = ctx.capture_mut() {
        let microphone = capture.acquire_microphone(settings.capture_frame_size)?;
        ctx.set_microphone(microphone);
    }

    // (e) duplex channel; the event queue exists before the channel does
    let (events_tx, events_rx) = mpsc::channel(CHANNEL_EVENT_CAPACITY);
    let channel = services
        .transport
        .open(&settings.session_config(), events_tx)
        .await?;
    ctx.set_channel(channel);

    Ok(events_rx)
}

/// Fire-and-forget greeting. Failures are logged and never touch the session.
async fn play_greeting_once(
    generator: Arc<dyn ContentGenerator>,
    output: Arc<dyn OutputSink>,
    text: String,
) {
    let chunk = match generator.synthesize_speech(&text).await {
        Ok(chunk) => chunk,
        Err(e) => {
            log::warn!("Greeting synthesis failed: {}", e);
            return;
        }
    };
    if output.is_closed() {
        log::debug!("Greeting dropped: output already closed");
        return;
    }
    match output.start_source(chunk.samples.clone(), chunk.sample_rate, output.current_time()) {
        Ok(_) => log::info!("Greeting playing ({:.2}s)", chunk.duration()),
        Err(e) => log::warn!("Greeting playback failed: {}", e),
    }
}

fn spawn_forwarder(
    id: Uuid,
    mut events: mpsc::Receiver<ChannelEvent>,
    mailbox: mpsc::Sender<Signal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if mailbox.send(Signal::Channel { id, event }).await.is_err() {
                break;
            }
        }
        log::debug!("Channel forwarder for {} exiting", id);
    })
}
