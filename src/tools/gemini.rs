//! Gemini REST client for content, image and speech generation
//!
//! One `generateContent` endpoint serves all three: the response modalities
//! decide whether the answer carries text, an inline image or inline audio.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::audio::pcm::{decode_base64, sample_rate_from_mime};
use crate::audio::{AudioChunk, OUTPUT_SAMPLE_RATE};
use crate::live::{Content, GenerationConfig, SpeechConfig};

/// REST API base URL
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Request timeout for generation calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors that can occur during generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// API key not configured
    MissingApiKey,
    /// Network/HTTP error
    NetworkError(String),
    /// API returned an error
    ApiError { status: u16, message: String },
    /// Failed to parse API response
    ParseError(String),
    /// The response carried nothing of the requested kind
    EmptyResponse(String),
}

impl std::fmt::Display for GenerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set GEMINI_API_KEY environment variable."
                )
            }
            GenerationError::NetworkError(e) => write!(f, "Network error: {}", e),
            GenerationError::ApiError { status, message } => {
                write!(f, "Gemini API error ({}): {}", status, message)
            }
            GenerationError::ParseError(e) => write!(f, "Failed to parse API response: {}", e),
            GenerationError::EmptyResponse(what) => write!(f, "Response contained no {}", what),
        }
    }
}

impl std::error::Error for GenerationError {}

/// A generated image, still base64 encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: String,
}

impl GeneratedImage {
    /// Embeddable `data:` reference
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// Auxiliary generation the tool calls and the greeting rely on
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_content(&self, prompt: &str) -> Result<String, GenerationError>;

    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, GenerationError>;

    /// Synthesize `text` as mono speech
    async fn synthesize_speech(&self, text: &str) -> Result<AudioChunk, GenerationError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

impl GenerateResponse {
    fn first_content(self) -> Option<Content> {
        self.candidates.into_iter().next().map(|c| c.content)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Model names used for each kind of generation
#[derive(Debug, Clone)]
pub struct GeminiModels {
    pub content: String,
    pub image: String,
    pub speech: String,
    /// Voice for synthesized speech
    pub voice_name: String,
}

/// [`ContentGenerator`] over the Gemini REST API
pub struct GeminiClient {
    http: Client,
    api_key: String,
    base_url: String,
    models: GeminiModels,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, models: GeminiModels) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GenerationError::NetworkError(e.to_string()))?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: GEMINI_API_BASE.to_string(),
            models,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        generation_config: Option<GenerationConfig>,
    ) -> Result<Content, GenerationError> {
        if self.api_key.is_empty() {
            return Err(GenerationError::MissingApiKey);
        }

        let model = model.strip_prefix("models/").unwrap_or(model);
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = GenerateRequest {
            contents: vec![Content::user_text(prompt)],
            generation_config,
        };

        log::info!("Requesting generation from {} ({} chars)", model, prompt.len());

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status.is_success() {
            let parsed: GenerateResponse = response
                .json()
                .await
                .map_err(|e| GenerationError::ParseError(e.to_string()))?;
            parsed
                .first_content()
                .ok_or_else(|| GenerationError::EmptyResponse("candidates".to_string()))
        } else {
            let error_text = response.text().await.unwrap_or_default();
            let message = api_error_message(&error_text);

            log::error!("Gemini API error ({}): {}", status.as_u16(), message);

            Err(GenerationError::ApiError {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body.to_string(),
    }
}

#[async_trait]
impl ContentGenerator for GeminiClient {
    async fn generate_content(&self, prompt: &str) -> Result<String, GenerationError> {
        let content = self.generate(&self.models.content, prompt, None).await?;
        let text = content.text();
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse("text".to_string()));
        }
        log::info!("Content generated: {} chars", text.len());
        Ok(text)
    }

    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, GenerationError> {
        let config = GenerationConfig {
            response_modalities: vec!["TEXT".to_string(), "IMAGE".to_string()],
            speech_config: None,
        };
        let content = self.generate(&self.models.image, prompt, Some(config)).await?;
        let blob = content
            .inline_data("image/")
            .ok_or_else(|| GenerationError::EmptyResponse("image".to_string()))?;

        log::info!("Image generated: {} ({} base64 bytes)", blob.mime_type, blob.data.len());
        Ok(GeneratedImage {
            mime_type: blob.mime_type.clone(),
            data: blob.data.clone(),
        })
    }

    async fn synthesize_speech(&self, text: &str) -> Result<AudioChunk, GenerationError> {
        let config = GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: Some(SpeechConfig::voice(self.models.voice_name.clone())),
        };
        let content = self.generate(&self.models.speech, text, Some(config)).await?;
        let blob = content
            .inline_data("audio/")
            .ok_or_else(|| GenerationError::EmptyResponse("audio".to_string()))?;

        let rate = sample_rate_from_mime(&blob.mime_type).unwrap_or(OUTPUT_SAMPLE_RATE);
        let chunk =
            decode_base64(&blob.data, rate).map_err(|e| GenerationError::ParseError(e.to_string()))?;
        log::info!("Speech synthesized: {:.2}s at {}Hz", chunk.duration(), rate);
        Ok(chunk)
    }
}
