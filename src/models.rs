use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Body and colour profile derived from the uploaded photo.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleAnalysis {
    pub body_shape: String,
    pub skin_undertone: String,
    pub estimated_height: String,
    pub base_style_vibe: String,
    pub makeup_advice: String,
    pub undertone_colors: Vec<String>,
}

impl StyleAnalysis {
    /// Lenient conversion from model output. Scalars may arrive as numbers or
    /// nulls, and the palette may be an array or a comma-separated string.
    /// The shorter keys older prompts asked for are accepted as fallbacks.
    pub fn from_value(value: &Value) -> Self {
        Self {
            body_shape: aliased_text(value, "bodyShape", "shape"),
            skin_undertone: aliased_text(value, "skinUndertone", "skinTone"),
            estimated_height: aliased_text(value, "estimatedHeight", "heightEstimate"),
            base_style_vibe: aliased_text(value, "baseStyleVibe", "baseStyle"),
            makeup_advice: text_field(value, "makeupAdvice"),
            undertone_colors: color_list(value.get("undertoneColors")),
        }
    }
}

fn aliased_text(value: &Value, key: &str, alias: &str) -> String {
    Some(text_field(value, key))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| text_field(value, alias))
}

fn color_list(value: Option<&Value>) -> Vec<String> {
    let entries: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    entries
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// An outfit as proposed by the grounded search, before enrichment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutfitCandidate {
    pub name: String,
    pub reasoning: String,
    pub match_score: u8,
    pub items: Vec<RawItem>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    pub name: String,
    pub brand: String,
    pub price: String,
    pub merchant_url: Option<String>,
    pub image_keyword: Option<String>,
}

impl OutfitCandidate {
    /// Lenient conversion from model output. Missing or mistyped fields fall
    /// back to empty values instead of rejecting the outfit.
    pub fn from_value(value: &Value) -> Self {
        let items = value
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(RawItem::from_value).collect())
            .unwrap_or_default();
        Self {
            name: text_field(value, "name"),
            reasoning: text_field(value, "reasoning"),
            match_score: score_field(value.get("matchScore")),
            items,
        }
    }
}

impl RawItem {
    pub fn from_value(value: &Value) -> Self {
        Self {
            name: text_field(value, "name"),
            brand: text_field(value, "brand"),
            price: text_field(value, "price"),
            merchant_url: optional_text(value, "merchantUrl"),
            image_keyword: optional_text(value, "imageKeyword"),
        }
    }
}

fn text_field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn optional_text(value: &Value, key: &str) -> Option<String> {
    Some(text_field(value, key)).filter(|s| !s.is_empty())
}

fn score_field(value: Option<&Value>) -> u8 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    raw.round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedOutfit {
    pub id: String,
    pub name: String,
    pub reasoning: String,
    pub match_score: u8,
    pub viewer_count: u32,
    pub items: Vec<EnrichedItem>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedItem {
    pub id: String,
    pub name: String,
    pub brand: String,
    pub price: String,
    pub merchant_url: Option<String>,
    pub image_keyword: Option<String>,
    pub original_url: String,
    pub affiliate_url: String,
    pub image_url: String,
}

/// Web citation attached to a grounded search answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    #[default]
    Idle,
    Analyzing,
    Results,
    TryingOn,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "IDLE",
            WorkflowState::Analyzing => "ANALYZING",
            WorkflowState::Results => "RESULTS",
            WorkflowState::TryingOn => "TRYING_ON",
        }
    }
}

/// An image held in memory for the current session only.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl SessionImage {
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.bytes))
    }
}

/// Read-only view of the session handed to the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: WorkflowState,
    pub analysis: Option<StyleAnalysis>,
    pub outfits: Vec<EnrichedOutfit>,
    pub sources: Vec<GroundingSource>,
    pub try_on_image: Option<String>,
    pub selected_outfit_id: Option<String>,
    pub apply_makeup: bool,
    pub error: Option<String>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
