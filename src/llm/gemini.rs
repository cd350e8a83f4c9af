use super::{
    GenerateRequest, GenerateResponse, GenerationMode, GroundingChunk, InferenceClient,
    InferenceError, Part,
};
use crate::config::{GEMINI_API_BASE, api_key_from_env};
use crate::http::build_client;
use crate::models::SessionImage;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_base: String,
    pub api_key: Option<String>,
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: GEMINI_API_BASE.clone(),
            api_key: api_key_from_env(),
        }
    }
}

pub struct GeminiClient {
    http: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.config.api_base, model_path)
    }
}

impl InferenceClient for GeminiClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, InferenceError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(InferenceError::MissingCredential)?;

        let endpoint = self.endpoint_for_model(&request.model);
        let body = GenerateContentBody::from_request(&request);
        debug!(
            target = "stylist.llm",
            model = %request.model,
            mode = ?request.mode,
            parts = request.parts.len(),
            prompt_chars = request.prompt().map(str::len).unwrap_or(0),
            "generate_content"
        );

        let response = self
            .http
            .post(endpoint)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|err| InferenceError::Http(err.without_url().to_string()))?;

        if !response.status().is_success() {
            return Err(InferenceError::Http(format!("HTTP {}", response.status())));
        }

        let payload: GenerateContentResponse = response
            .json()
            .await
            .map_err(|err| InferenceError::InvalidResponse(err.to_string()))?;

        payload.into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentBody {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

impl GenerateContentBody {
    fn from_request(request: &GenerateRequest) -> Self {
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => RequestPart::Text(TextPart { text: text.clone() }),
                Part::InlineImage(image) => RequestPart::Inline(InlinePart {
                    inline_data: Blob {
                        mime_type: image.mime_type.clone(),
                        data: BASE64.encode(&image.bytes),
                    },
                }),
            })
            .collect();

        let (generation_config, tools) = match request.mode {
            GenerationMode::FreeText => (None, Vec::new()),
            GenerationMode::StructuredJson => (
                Some(GenerationConfig {
                    response_mime_type: "application/json",
                }),
                Vec::new(),
            ),
            GenerationMode::GroundedSearch => (
                None,
                vec![Tool {
                    google_search: GoogleSearch {},
                }],
            ),
        };

        Self {
            contents: vec![Content {
                role: "user",
                parts,
            }],
            generation_config,
            tools,
        }
    }
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text(TextPart),
    Inline(InlinePart),
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlinePart {
    inline_data: Blob,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Debug, Serialize)]
struct GoogleSearch {}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "inline_data")]
    inline_data: Option<ResponseBlob>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBlob {
    #[serde(default, alias = "mime_type")]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

impl GenerateContentResponse {
    /// Only the first candidate is considered.
    fn into_response(self) -> Result<GenerateResponse, InferenceError> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            return Ok(GenerateResponse::default());
        };

        let mut text = String::new();
        let mut inline_images = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if part.thought {
                continue;
            }
            if let Some(chunk) = part.text {
                text.push_str(&chunk);
            }
            if let Some(blob) = part.inline_data
                && !blob.data.is_empty()
            {
                let bytes = BASE64
                    .decode(blob.data.as_bytes())
                    .map_err(|err| InferenceError::InvalidResponse(err.to_string()))?;
                let mime_type = if blob.mime_type.is_empty() {
                    "image/png".to_string()
                } else {
                    blob.mime_type
                };
                inline_images.push(SessionImage { mime_type, bytes });
            }
        }

        let grounding_chunks = candidate
            .grounding_metadata
            .map(|meta| meta.grounding_chunks)
            .unwrap_or_default();

        Ok(GenerateResponse {
            text,
            grounding_chunks,
            inline_images,
        })
    }
}
