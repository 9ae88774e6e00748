//! Session error classification
//!
//! Every failure that ends a session attempt is reduced to a [`Fault`] (an
//! identifying name plus a message) and classified into one of four
//! user-actionable buckets. Matching is signature based, so faults raised by
//! the audio layer, the duplex channel, or anything else share one taxonomy.

use serde::Serialize;

use crate::audio::AudioError;
use crate::live::LiveError;

/// The four buckets every session error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceNotFound,
    ConnectionFailed,
    Unknown,
}

/// Structured, user-facing error held by the controller until cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppError {
    pub kind: ErrorKind,
    pub title: String,
    pub message: String,
    /// Ordered remediation steps (empty for `Unknown`)
    pub steps: Vec<String>,
}

/// Raw fault as reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub name: String,
    pub message: String,
}

impl Fault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl From<AudioError> for Fault {
    fn from(err: AudioError) -> Self {
        let name = match err {
            AudioError::PermissionDenied(_) => "NotAllowedError",
            AudioError::NoInputDevice => "NotFoundError",
            AudioError::NoOutputDevice
            | AudioError::NoSupportedConfig
            | AudioError::StreamCreationFailed(_)
            | AudioError::ContextClosed => AUDIO_FAULT_NAME,
        };
        Fault::new(name, err.to_string())
    }
}

impl From<LiveError> for Fault {
    fn from(err: LiveError) -> Self {
        let name = match err {
            LiveError::MissingApiKey | LiveError::AuthenticationFailed(_) => "AuthenticationError",
            LiveError::ProtocolError(_) => "ProtocolError",
            LiveError::ConnectionFailed(_) | LiveError::Disconnected(_) | LiveError::SendFailed(_) => {
                "NetworkError"
            }
        };
        Fault::new(name, err.to_string())
    }
}

const AUDIO_FAULT_NAME: &str = "AudioError";

const PERMISSION_SIGNATURES: &[&str] = &[
    "notallowederror",
    "permissiondenied",
    "permission denied",
    "permission dismissed",
    "securityerror",
];

const DEVICE_SIGNATURES: &[&str] = &[
    "notfounderror",
    "devicesnotfound",
    "requested device not found",
    "device not found",
    "no audio input device",
    "no input device",
    "no microphone",
];

const CONNECTION_SIGNATURES: &[&str] = &[
    "authentication",
    "unauthenticated",
    "unauthorized",
    "credential",
    "api key",
    "api_key",
    "forbidden",
    "rejected",
    "protocolerror",
    "networkerror",
    "network",
    "connection refused",
    "connection reset",
    "connection closed",
    "connection failed",
    "failed to connect",
    "could not connect",
    "unable to connect",
    "websocket",
    "timed out",
    "timeout",
    "cross-origin",
    "cors",
];

fn matches_any(haystack: &str, signatures: &[&str]) -> bool {
    signatures.iter().any(|sig| haystack.contains(sig))
}

/// Classify a raw fault into a user-actionable [`AppError`].
///
/// Precedence is permission, then missing device, then connectivity; anything
/// else passes its own message through with no remediation steps.
pub fn classify(fault: &Fault) -> AppError {
    let haystack = format!("{} {}", fault.name, fault.message).to_lowercase();

    if matches_any(&haystack, PERMISSION_SIGNATURES) {
        return AppError {
            kind: ErrorKind::PermissionDenied,
            title: "Microphone access required".to_string(),
            message: "Microphone access was denied, so the conversation cannot hear you."
                .to_string(),
            steps: vec![
                "Allow microphone access when your system asks for it".to_string(),
                "Start the conversation again after granting access".to_string(),
                "Check the microphone privacy settings for this application".to_string(),
            ],
        };
    }

    if matches_any(&haystack, DEVICE_SIGNATURES) {
        return AppError {
            kind: ErrorKind::DeviceNotFound,
            title: "No microphone found".to_string(),
            message: "No audio input device is available.".to_string(),
            steps: vec![
                "Connect a microphone or headset".to_string(),
                "Make sure it is enabled and selected as the default input device".to_string(),
                "Start the conversation again".to_string(),
            ],
        };
    }

    // Audio-layer faults never describe the server
    if fault.name != AUDIO_FAULT_NAME && matches_any(&haystack, CONNECTION_SIGNATURES) {
        return AppError {
            kind: ErrorKind::ConnectionFailed,
            title: "Server connection error".to_string(),
            message: "Could not reach the conversation service.".to_string(),
            steps: vec![
                "Check your internet connection".to_string(),
                "Verify that GEMINI_API_KEY is set and valid".to_string(),
                "The service may be temporarily unavailable, try again in a moment".to_string(),
            ],
        };
    }

    let message = if fault.message.is_empty() {
        if fault.name.is_empty() {
            "An unexpected error occurred.".to_string()
        } else {
            fault.name.clone()
        }
    } else {
        fault.message.clone()
    };

    AppError {
        kind: ErrorKind::Unknown,
        title: "Something went wrong".to_string(),
        message,
        steps: Vec::new(),
    }
}
