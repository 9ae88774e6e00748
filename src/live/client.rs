//! Live API WebSocket client
//!
//! # Connection Flow
//!
//! 1. `open()` - Establish WebSocket, send `setup`, wait for `setupComplete`
//! 2. Writer task drains the [`LiveSender`] queue onto the socket
//! 3. Reader task turns frames into [`ChannelEvent`]s
//! 4. `ChannelHandle::close()` - send a close frame and stop both tasks
//!
//! Connection failures are reported once. There is no retry or reconnect.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tokio_util::sync::CancellationToken;

use super::protocol::{
    ClientMessage, FunctionResponse, InboundEvent, ServerMessage, SessionConfig, LIVE_API_URL,
};
use super::LiveError;

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for setupComplete
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the outbound message queue
const OUTBOUND_CAPACITY: usize = 64;

/// Something that happened on an open channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(InboundEvent),
    Error(LiveError),
    /// The channel closed. `clean` is true for a normal close.
    Closed { clean: bool, reason: String },
}

/// Send-only handle to an open channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LiveSender {
    tx: mpsc::Sender<ClientMessage>,
}

impl LiveSender {
    /// Create a sender and the queue a writer drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ClientMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue one captured frame without waiting.
    ///
    /// Fails immediately if the queue is full or the channel is gone; audio
    /// is never buffered for later.
    pub fn try_send_audio(&self, samples: &[f32], sample_rate: u32) -> Result<(), LiveError> {
        self.tx
            .try_send(ClientMessage::audio_input(samples, sample_rate))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    LiveError::SendFailed("Outbound queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    LiveError::Disconnected("Channel closed".to_string())
                }
            })
    }

    pub async fn send_tool_response(&self, response: FunctionResponse) -> Result<(), LiveError> {
        self.tx
            .send(ClientMessage::tool_response(response))
            .await
            .map_err(|_| LiveError::Disconnected("Channel closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner's handle to an open channel.
///
/// Closing (or dropping) it stops the writer and reader; outstanding
/// [`LiveSender`] clones start failing once the writer is gone.
#[derive(Debug)]
pub struct ChannelHandle {
    sender: LiveSender,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelHandle {
    /// `tasks` are aborted on close; the writer should watch `cancel` so it
    /// can send its own close frame first.
    pub fn new(sender: LiveSender, cancel: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            sender,
            cancel,
            tasks,
        }
    }

    pub fn sender(&self) -> LiveSender {
        self.sender.clone()
    }

    pub fn close(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        log::info!("Closing duplex channel...");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens duplex channels
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel configured with `config`.
    ///
    /// Returns once the server has acknowledged the setup. Every later
    /// inbound frame, error or close is delivered on `events`.
    async fn open(
        &self,
        config: &SessionConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<ChannelHandle, LiveError>;
}

/// [`Transport`] over a real WebSocket
#[derive(Debug, Clone)]
pub struct LiveTransport {
    api_key: String,
    url: String,
    connect_timeout: Duration,
    setup_timeout: Duration,
}

impl LiveTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: LIVE_API_URL.to_string(),
            connect_timeout: CONNECTION_TIMEOUT,
            setup_timeout: SETUP_TIMEOUT,
        }
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, setup: Duration) -> Self {
        self.connect_timeout = connect;
        self.setup_timeout = setup;
        self
    }
}

/// Classify a close frame: normal closes end the session without error.
fn close_event(frame: Option<CloseFrame<'_>>) -> ChannelEvent {
    match frame {
        Some(frame) => ChannelEvent::Closed {
            clean: matches!(frame.code, CloseCode::Normal | CloseCode::Away),
            reason: if frame.reason.is_empty() {
                format!("closed with code {}", u16::from(frame.code))
            } else {
                frame.reason.to_string()
            },
        },
        None => ChannelEvent::Closed {
            clean: true,
            reason: "closed by server".to_string(),
        },
    }
}

fn setup_close_error(frame: Option<CloseFrame<'_>>) -> LiveError {
    let reason = frame
        .map(|f| f.reason.to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "Connection closed before setup completed".to_string());
    let lower = reason.to_lowercase();
    if lower.contains("api key") || lower.contains("permission") || lower.contains("unauth") {
        LiveError::AuthenticationFailed(reason)
    } else {
        LiveError::Disconnected(reason)
    }
}

fn frame_text(msg: &Message) -> Option<&str> {
    match msg {
        Message::Text(text) => Some(text.as_str()),
        // The server sends JSON in binary frames too
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

#[async_trait]
impl Transport for LiveTransport {
    async fn open(
        &self,
        config: &SessionConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<ChannelHandle, LiveError> {
        if self.api_key.is_empty() {
            return Err(LiveError::MissingApiKey);
        }

        let request = format!("{}?key={}", self.url, self.api_key)
            .into_client_request()
            .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;

        log::info!("Connecting to Live API (model: {})...", config.model);

        let (ws_stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| LiveError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let setup = serde_json::to_string(&ClientMessage::setup(config))
            .map_err(|e| LiveError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| LiveError::SendFailed(e.to_string()))?;

        log::info!("WebSocket connected, waiting for setupComplete...");

        timeout(self.setup_timeout, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Close(frame)) => return Err(setup_close_error(frame)),
                    Ok(msg) => match frame_text(&msg).map(ServerMessage::parse) {
                        Some(Ok(parsed)) if parsed.is_setup_complete() => return Ok(()),
                        Some(Ok(_)) => {
                            log::debug!("Ignoring message while waiting for setupComplete");
                        }
                        Some(Err(e)) => log::warn!("Failed to parse message: {}", e),
                        None => {}
                    },
                    Err(e) => return Err(LiveError::ProtocolError(e.to_string())),
                }
            }
            Err(LiveError::Disconnected("Stream ended".to_string()))
        })
        .await
        .map_err(|_| LiveError::ConnectionFailed("Setup timeout".to_string()))??;

        log::info!("Live session set up");

        let cancel = CancellationToken::new();
        let (sender, mut outbound_rx) = LiveSender::channel(OUTBOUND_CAPACITY);

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                log::warn!("Failed to serialize outbound message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json)).await {
                            log::warn!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                }
            }
            if let Err(e) = write.close().await {
                log::debug!("Error closing WebSocket: {}", e);
            }
            log::debug!("Writer task exiting");
        });

        let reader = tokio::spawn(async move {
            let terminal = loop {
                match read.next().await {
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("WebSocket closed by server");
                        break close_event(frame);
                    }
                    Some(Ok(msg)) => {
                        let Some(text) = frame_text(&msg) else {
                            continue; // ping/pong
                        };
                        match ServerMessage::parse(text) {
                            Ok(parsed) => {
                                for event in parsed.into_events() {
                                    if events.send(ChannelEvent::Message(event)).await.is_err() {
                                        log::debug!("Event mailbox closed");
                                        return;
                                    }
                                }
                            }
                            Err(e) => log::warn!("Failed to parse message: {}", e),
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {}", e);
                        break ChannelEvent::Error(LiveError::ProtocolError(e.to_string()));
                    }
                    None => {
                        break ChannelEvent::Closed {
                            clean: false,
                            reason: "Stream ended".to_string(),
                        }
                    }
                }
            };
            let _ = events.send(terminal).await;
            log::debug!("Reader task exiting");
        });

        // The writer is left to finish its close frame; only the reader is aborted.
        drop(writer);
        Ok(ChannelHandle::new(sender, cancel, vec![reader]))
    }
}
