use once_cell::sync::Lazy;
use std::env;

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Model used for style analysis and grounded outfit search.
pub static TEXT_MODEL: Lazy<String> =
    Lazy::new(|| env_or("STYLIST_TEXT_MODEL", "gemini-3-flash-preview"));

/// Image-capable model used for the virtual try-on.
pub static IMAGE_MODEL: Lazy<String> =
    Lazy::new(|| env_or("STYLIST_IMAGE_MODEL", "gemini-2.5-flash-image"));

pub static GEMINI_API_BASE: Lazy<String> = Lazy::new(|| {
    env_or(
        "GEMINI_API_BASE",
        "https://generativelanguage.googleapis.com/v1beta",
    )
    .trim_end_matches('/')
    .to_string()
});

/// The single inference credential. `API_KEY` wins over `GEMINI_API_KEY`;
/// blank values count as absent.
pub fn api_key_from_env() -> Option<String> {
    ["API_KEY", "GEMINI_API_KEY"].iter().find_map(|key| {
        env::var(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Outfit-card imagery: a stock fashion photo tagged with the item keyword.
pub const IMAGE_SEARCH_TEMPLATE: &str = "https://images.unsplash.com/photo-1515886657613-9f3515b0c78f?auto=format&fit=crop&w=600&q=80&fashion=";

/// Fallback product link when the model did not return a merchant URL.
pub const WEB_SEARCH_TEMPLATE: &str = "https://www.google.com/search?q=";
