//! Tool-call interception and dispatch
//!
//! The remote engine asks for content or images through function calls. Each
//! batch runs on its own task: every invocation is announced in the history,
//! executed, and answered with exactly one correlated tool response, whether
//! it succeeded, failed or named a tool we do not have.

mod gemini;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use crate::history::Message;
use crate::live::{FunctionCall, FunctionDeclaration, FunctionResponse, LiveSender};

pub use gemini::{
    ContentGenerator, GeminiClient, GeminiModels, GeneratedImage, GenerationError,
    GEMINI_API_BASE,
};

pub const GENERATE_CONTENT: &str = "generateContent";
pub const GENERATE_IMAGE: &str = "generateImage";

/// Declarations sent with the session setup
pub fn declarations() -> Vec<FunctionDeclaration> {
    vec![
        FunctionDeclaration {
            name: GENERATE_CONTENT.to_string(),
            description: "Generate written content such as text, lists or code and show it \
                          to the user."
                .to_string(),
            parameters: prompt_schema("What to write"),
        },
        FunctionDeclaration {
            name: GENERATE_IMAGE.to_string(),
            description: "Generate an image and show it to the user.".to_string(),
            parameters: prompt_schema("Description of the image"),
        },
    ]
}

fn prompt_schema(description: &str) -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "prompt": { "type": "STRING", "description": description }
        },
        "required": ["prompt"]
    })
}

/// A parsed invocation. Anything we cannot run is `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    GenerateContent { prompt: String },
    GenerateImage { prompt: String },
    Unknown { name: String },
}

impl ToolCall {
    pub fn parse(name: &str, args: &serde_json::Value) -> Self {
        let prompt = args
            .get("prompt")
            .and_then(|p| p.as_str())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        match (name, prompt) {
            (GENERATE_CONTENT, Some(prompt)) => ToolCall::GenerateContent { prompt },
            (GENERATE_IMAGE, Some(prompt)) => ToolCall::GenerateImage { prompt },
            _ => ToolCall::Unknown {
                name: name.to_string(),
            },
        }
    }
}

/// Progress reported back to the controller loop
#[derive(Debug, Clone, PartialEq)]
pub enum ToolUpdate {
    /// Brackets a whole batch
    Thinking(bool),
    Append(Message),
    Completed { id: String, ok: bool },
}

/// Sends `Thinking(false)` when the batch ends, however it ends.
struct ThinkingGuard<'a>(&'a mpsc::UnboundedSender<ToolUpdate>);

impl<'a> ThinkingGuard<'a> {
    fn begin(updates: &'a mpsc::UnboundedSender<ToolUpdate>) -> Self {
        let _ = updates.send(ToolUpdate::Thinking(true));
        Self(updates)
    }
}

impl Drop for ThinkingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.send(ToolUpdate::Thinking(false));
    }
}

pub struct ToolCallDispatcher {
    generator: Arc<dyn ContentGenerator>,
    sender: LiveSender,
    updates: mpsc::UnboundedSender<ToolUpdate>,
}

impl ToolCallDispatcher {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        sender: LiveSender,
        updates: mpsc::UnboundedSender<ToolUpdate>,
    ) -> Self {
        Self {
            generator,
            sender,
            updates,
        }
    }

    /// Run every call of one batch, in order.
    pub async fn dispatch(&self, calls: Vec<FunctionCall>) {
        let _thinking = ThinkingGuard::begin(&self.updates);
        log::info!("Tool batch: {} call(s)", calls.len());

        for call in calls {
            self.invoke(call).await;
        }
    }

    /// Run one call and send its response. Returns whether it succeeded.
    pub async fn invoke(&self, call: FunctionCall) -> bool {
        let tool = ToolCall::parse(&call.name, &call.args);
        log::info!("Tool call {}: {:?}", call.id, tool);

        let (ok, result) = match tool {
            ToolCall::GenerateContent { prompt } => {
                self.append(Message::user_text(format!("Generate content: {}", prompt)));
                match self.generator.generate_content(&prompt).await {
                    Ok(text) => {
                        self.append(Message::model_content(text));
                        (true, "Content generated and shown to the user.".to_string())
                    }
                    Err(e) => {
                        log::warn!("Tool call {}: content generation failed: {}", call.id, e);
                        self.append(Message::model_text(
                            "Sorry, I couldn't generate that content. Please try again.",
                        ));
                        (false, format!("Failed to generate content: {}", e))
                    }
                }
            }
            ToolCall::GenerateImage { prompt } => {
                self.append(Message::user_text(format!("Generate an image: {}", prompt)));
                match self.generator.generate_image(&prompt).await {
                    Ok(image) => {
                        self.append(Message::model_image(image.data_url()));
                        (true, "Image generated and shown to the user.".to_string())
                    }
                    Err(e) => {
                        log::warn!("Tool call {}: image generation failed: {}", call.id, e);
                        self.append(Message::model_text(
                            "Sorry, I couldn't generate that image. Please try again.",
                        ));
                        (false, format!("Failed to generate image: {}", e))
                    }
                }
            }
            ToolCall::Unknown { name } => {
                log::warn!("Tool call {}: unknown or malformed tool {:?}", call.id, name);
                (false, format!("Unknown tool: {}", name))
            }
        };

        let response = FunctionResponse::new(call.id.clone(), call.name, result);
        if let Err(e) = self.sender.send_tool_response(response).await {
            // Channel already torn down
            log::debug!("Tool call {}: response not delivered: {}", call.id, e);
        }

        let _ = self.updates.send(ToolUpdate::Completed { id: call.id, ok });
        ok
    }

    fn append(&self, message: Message) {
        let _ = self.updates.send(ToolUpdate::Append(message));
    }
}
