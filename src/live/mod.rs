//! Duplex channel to the remote conversational engine
//!
//! A WebSocket session speaking the Live API protocol. The session controller
//! only sees the [`Transport`] seam: opening returns a [`ChannelHandle`] whose
//! [`LiveSender`] is the one way to write to the channel, while inbound frames
//! arrive as [`ChannelEvent`]s on the mailbox passed to `open`.
//!
//! # Architecture
//!
//! ```text
//!  LiveSender ──mpsc──▶ writer task ──▶ WebSocket ──▶ reader task ──▶ ChannelEvent
//!  (capture pipe,                                                    (controller
//!   tool dispatcher)                                                   mailbox)
//! ```
//!
//! There is no reconnection: a dropped channel ends the session and the caller
//! decides whether to start again.

mod client;
mod protocol;

pub use client::{ChannelEvent, ChannelHandle, LiveSender, LiveTransport, Transport};
pub use protocol::{
    Blob, ClientMessage, Content, FunctionCall, FunctionDeclaration, FunctionResponse,
    GenerationConfig, InboundEvent, Part, ServerMessage, SessionConfig, SpeechConfig,
    LIVE_API_URL,
};

/// Errors that can occur on the duplex channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveError {
    /// API key not configured
    MissingApiKey,
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// The server rejected our credentials
    AuthenticationFailed(String),
    /// Malformed or unexpected frame
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to queue an outbound message
    SendFailed(String),
}

impl std::fmt::Display for LiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set GEMINI_API_KEY environment variable."
                )
            }
            LiveError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to the Live API: {}", e)
            }
            LiveError::AuthenticationFailed(e) => {
                write!(f, "Authentication failed: {}", e)
            }
            LiveError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            LiveError::Disconnected(e) => {
                write!(f, "WebSocket disconnected: {}", e)
            }
            LiveError::SendFailed(e) => {
                write!(f, "Failed to send message: {}", e)
            }
        }
    }
}

impl std::error::Error for LiveError {}
