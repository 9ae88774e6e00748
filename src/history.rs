//! Conversation history
//!
//! Messages are immutable once created. The history is kept newest-first and
//! only grows during a session.

use std::collections::VecDeque;

use serde::Serialize;
use uuid::Uuid;

/// Marker that turns generated content into a code message.
const CODE_FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentType {
    Text,
    Code,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content_type: ContentType,
    /// Plain text, fenced code, or an embeddable image reference
    pub text: String,
}

impl Message {
    pub fn new(role: Role, content_type: ContentType, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content_type,
            text: text.into(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, ContentType::Text, text)
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, ContentType::Text, text)
    }

    /// Generated content: classified as code when it carries a fenced block.
    pub fn model_content(text: impl Into<String>) -> Self {
        let text = text.into();
        let content_type = if text.contains(CODE_FENCE) {
            ContentType::Code
        } else {
            ContentType::Text
        };
        Self::new(Role::Model, content_type, text)
    }

    pub fn model_image(image_ref: impl Into<String>) -> Self {
        Self::new(Role::Model, ContentType::Image, image_ref)
    }
}

/// Newest-first, append-only message log.
#[derive(Debug, Default, Clone)]
pub struct History {
    messages: VecDeque<Message>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push_front(message);
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }
}
