mod gemini;

pub use gemini::{GeminiClient, GeminiConfig};

use crate::models::SessionImage;
use serde::Deserialize;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no inference credential configured")]
    MissingCredential,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// The three request configurations the inference service understands.
/// Forced JSON output and search grounding cannot be combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    FreeText,
    StructuredJson,
    GroundedSearch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    InlineImage(SessionImage),
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub parts: Vec<Part>,
    pub mode: GenerationMode,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, mode: GenerationMode) -> Self {
        Self {
            model: model.into(),
            parts: Vec::new(),
            mode,
        }
    }

    pub fn with_image(mut self, image: SessionImage) -> Self {
        self.parts.push(Part::InlineImage(image));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(Part::Text(text.into()));
        self
    }

    pub fn prompt(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            Part::Text(text) => Some(text.as_str()),
            Part::InlineImage(_) => None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    pub text: String,
    pub grounding_chunks: Vec<GroundingChunk>,
    pub inline_images: Vec<SessionImage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroundingChunk {
    #[serde(default)]
    pub web: Option<WebReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebReference {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uri: String,
}

/// Boundary to the generative-AI service.
pub trait InferenceClient: Send + Sync {
    fn generate(
        &self,
        request: GenerateRequest,
    ) -> impl Future<Output = Result<GenerateResponse, InferenceError>> + Send;
}
