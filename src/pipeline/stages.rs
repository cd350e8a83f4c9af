use super::{PipelineError, PipelineErrorKind, StageOutcome};
use crate::affiliate;
use crate::config::{IMAGE_SEARCH_TEMPLATE, WEB_SEARCH_TEMPLATE};
use crate::llm::{GenerateRequest, GenerationMode, InferenceClient, InferenceError};
use crate::models::{
    EnrichedItem, EnrichedOutfit, GroundingSource, OutfitCandidate, RawItem, SessionImage,
    StyleAnalysis,
};
use crate::repair;
use rand::Rng;
use serde_json::{Value, json};
use tracing::info;
use urlencoding::encode;

pub const ANALYZE: &str = "analyze_style";
pub const SEARCH: &str = "search_outfits";
pub const ENRICH: &str = "enrich_outfits";
pub const RENDER: &str = "render_try_on";

const RETAIL_PARTNERS: &[&str] = &["Zalando", "H&M", "AboutYou"];
const OUTFIT_COUNT: usize = 3;
const VIEWER_COUNT_MIN: u32 = 10;
const VIEWER_COUNT_MAX: u32 = 89;

const ANALYSIS_PROMPT: &str = r#"
Analyse this photo for a personal styling consultation. Determine the person's body shape (bodyShape),
skin undertone (skinUndertone), estimated height (estimatedHeight) and current style vibe (baseStyleVibe).
Also suggest a matching make-up look (makeupAdvice) and a palette of flattering colours as hex codes
(undertoneColors). Answer strictly as a JSON object with exactly these keys and no markdown.
"#;

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub outfits: Vec<OutfitCandidate>,
    pub sources: Vec<GroundingSource>,
}

fn inference_failure(
    stage: &'static str,
    kind: PipelineErrorKind,
    err: InferenceError,
) -> PipelineError {
    match err {
        InferenceError::MissingCredential => PipelineError::configuration(stage, err.to_string()),
        other => PipelineError::new(stage, kind, other.to_string()),
    }
}

/// Derive a [`StyleAnalysis`] from the uploaded photo.
///
/// The request forces JSON output, so the text is parsed as-is. Only text
/// that is not a JSON object fails the stage; mistyped fields are tolerated.
pub async fn analyze<C: InferenceClient>(
    client: &C,
    model: &str,
    image: &SessionImage,
) -> Result<StageOutcome<StyleAnalysis>, PipelineError> {
    let request = GenerateRequest::new(model, GenerationMode::StructuredJson)
        .with_image(image.clone())
        .with_text(ANALYSIS_PROMPT.trim());

    let response = client
        .generate(request)
        .await
        .map_err(|err| inference_failure(ANALYZE, PipelineErrorKind::Analysis, err))?;

    let value: Value = serde_json::from_str(response.text.trim()).map_err(|err| {
        PipelineError::analysis(ANALYZE, format!("unparseable analysis json: {err}"))
    })?;
    if !value.is_object() {
        return Err(PipelineError::analysis(
            ANALYZE,
            "analysis json is not an object",
        ));
    }
    let analysis = StyleAnalysis::from_value(&value);

    Ok(StageOutcome::new(
        analysis.clone(),
        json!({
            "body_shape": analysis.body_shape,
            "skin_undertone": analysis.skin_undertone,
            "palette_size": analysis.undertone_colors.len(),
            "image_bytes": image.bytes.len(),
        }),
    ))
}

fn search_prompt(analysis_json: &str) -> String {
    format!(
        "Based on this style profile: {analysis_json}, search for {OUTFIT_COUNT} real outfits that are \
         currently sold at {partners}. Answer in this JSON format: \
         {{\"outfits\": [{{\"name\": \"...\", \"reasoning\": \"...\", \"matchScore\": 95, \"items\": \
         [{{\"name\": \"...\", \"brand\": \"...\", \"price\": \"...\", \"merchantUrl\": \"...\", \
         \"imageKeyword\": \"...\"}}]}}]}}. Return ONLY JSON, no surrounding text.",
        partners = RETAIL_PARTNERS.join(", "),
    )
}

/// Ask the search-grounded model for concrete outfits matching the analysis.
///
/// Unusable response text degrades to zero outfits; only a failed call is an
/// error.
pub async fn search<C: InferenceClient>(
    client: &C,
    model: &str,
    analysis: &StyleAnalysis,
) -> Result<StageOutcome<SearchResults>, PipelineError> {
    let analysis_json = serde_json::to_string(analysis)
        .map_err(|err| PipelineError::search(SEARCH, err.to_string()))?;
    let request = GenerateRequest::new(model, GenerationMode::GroundedSearch)
        .with_text(search_prompt(&analysis_json));

    let response = client
        .generate(request)
        .await
        .map_err(|err| inference_failure(SEARCH, PipelineErrorKind::Search, err))?;

    let payload = repair::extract_json(&response.text);
    let outfits: Vec<OutfitCandidate> = payload
        .get("outfits")
        .and_then(Value::as_array)
        .map(|outfits| outfits.iter().map(OutfitCandidate::from_value).collect())
        .unwrap_or_default();

    let sources: Vec<GroundingSource> = response
        .grounding_chunks
        .into_iter()
        .filter_map(|chunk| chunk.web)
        .map(|web| GroundingSource {
            title: web.title,
            uri: web.uri,
        })
        .collect();

    Ok(StageOutcome::new(
        SearchResults {
            outfits: outfits.clone(),
            sources: sources.clone(),
        },
        json!({
            "outfit_count": outfits.len(),
            "source_count": sources.len(),
            "text_len": response.text.len(),
        }),
    ))
}

/// Attach ids, product links and card imagery to raw outfits.
pub fn enrich(raw_outfits: &[OutfitCandidate]) -> Vec<EnrichedOutfit> {
    let mut rng = rand::rng();
    raw_outfits
        .iter()
        .enumerate()
        .map(|(outfit_idx, outfit)| EnrichedOutfit {
            id: format!("search-outfit-{outfit_idx}"),
            name: outfit.name.clone(),
            reasoning: outfit.reasoning.clone(),
            match_score: outfit.match_score,
            viewer_count: rng.random_range(VIEWER_COUNT_MIN..=VIEWER_COUNT_MAX),
            items: outfit
                .items
                .iter()
                .enumerate()
                .map(|(item_idx, item)| enrich_item(outfit_idx, item_idx, item))
                .collect(),
        })
        .collect()
}

fn enrich_item(outfit_idx: usize, item_idx: usize, item: &RawItem) -> EnrichedItem {
    let original_url = item
        .merchant_url
        .clone()
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| {
            format!(
                "{WEB_SEARCH_TEMPLATE}{}",
                encode(&format!("{} {}", item.brand, item.name))
            )
        });
    let affiliate_url = affiliate::resolve(&original_url, &item.brand);
    let keyword = item
        .image_keyword
        .as_deref()
        .filter(|keyword| !keyword.is_empty())
        .unwrap_or(&item.name);

    EnrichedItem {
        id: format!("item-{outfit_idx}-{item_idx}"),
        name: item.name.clone(),
        brand: item.brand.clone(),
        price: item.price.clone(),
        merchant_url: item.merchant_url.clone(),
        image_keyword: item.image_keyword.clone(),
        original_url,
        affiliate_url,
        image_url: format!("{IMAGE_SEARCH_TEMPLATE}{}", encode(keyword)),
    }
}

fn try_on_prompt(outfit: &EnrichedOutfit, makeup: Option<&str>) -> String {
    let items = outfit
        .items
        .iter()
        .map(|item| format!("{} by {}", item.name, item.brand))
        .collect::<Vec<_>>()
        .join(", ");
    let mut prompt = format!(
        "Virtual try-on: dress the person in this photo in the outfit \"{}\"",
        outfit.name
    );
    if !items.is_empty() {
        prompt.push_str(&format!(", consisting of: {items}"));
    }
    prompt.push_str(
        ". Preserve the person's identity exactly: face, hair, body shape, skin tone and pose stay unchanged.",
    );
    if let Some(makeup) = makeup {
        prompt.push_str(&format!(" Also apply this make-up look: {makeup}."));
    }
    prompt
}

/// Render the user wearing `outfit`. The first inline image in the response
/// is the result.
pub async fn render<C: InferenceClient>(
    client: &C,
    model: &str,
    image: &SessionImage,
    outfit: &EnrichedOutfit,
    makeup: Option<&str>,
) -> Result<StageOutcome<SessionImage>, PipelineError> {
    let request = GenerateRequest::new(model, GenerationMode::FreeText)
        .with_image(image.clone())
        .with_text(try_on_prompt(outfit, makeup));

    let response = client
        .generate(request)
        .await
        .map_err(|err| inference_failure(RENDER, PipelineErrorKind::RenderUnavailable, err))?;

    let image_count = response.inline_images.len();
    let rendered = response.inline_images.into_iter().next().ok_or_else(|| {
        PipelineError::render_unavailable(RENDER, "response contained no inline image")
    })?;
    if image_count > 1 {
        info!(
            target = "stylist.pipeline",
            image_count, "try_on_multiple_images_first_used"
        );
    }

    Ok(StageOutcome::new(
        rendered.clone(),
        json!({
            "outfit_id": outfit.id,
            "mime_type": rendered.mime_type,
            "bytes": rendered.bytes.len(),
            "makeup": makeup.is_some(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{self, ScriptedClient};

    fn photo() -> SessionImage {
        SessionImage {
            mime_type: "image/jpeg".into(),
            bytes: vec![0xff, 0xd8, 0xff],
        }
    }

    fn candidate(items: Vec<RawItem>) -> OutfitCandidate {
        OutfitCandidate {
            name: "Look".into(),
            reasoning: "fits".into(),
            match_score: 90,
            items,
        }
    }

    #[tokio::test]
    async fn analyze_uses_structured_mode_and_parses() {
        let client = ScriptedClient::new(vec![testing::text(testing::ANALYSIS_JSON)]);
        let out = analyze(&client, "text-model", &photo()).await.expect("analyze");
        assert_eq!(out.value.body_shape, "hourglass");
        assert_eq!(out.value.undertone_colors, vec!["#C19A6B", "#E2725B"]);

        let requests = client.requests();
        assert_eq!(requests[0].mode, GenerationMode::StructuredJson);
        assert_eq!(requests[0].model, "text-model");
        assert!(requests[0].prompt().unwrap().contains("undertoneColors"));
    }

    #[tokio::test]
    async fn analyze_rejects_unparseable_text() {
        let client = ScriptedClient::new(vec![testing::text("```json\n{}\n```")]);
        let err = analyze(&client, "m", &photo()).await.expect_err("parse");
        assert_eq!(err.kind(), PipelineErrorKind::Analysis);
        assert_eq!(err.stage(), ANALYZE);
    }

    #[tokio::test]
    async fn analyze_tolerates_mistyped_fields() {
        let raw = r##"{"bodyShape":null,"skinUndertone":"cool","estimatedHeight":168,"baseStyleVibe":"sporty","undertoneColors":"#112233, #445566"}"##;
        let client = ScriptedClient::new(vec![testing::text(raw)]);
        let out = analyze(&client, "m", &photo()).await.expect("analyze");
        assert_eq!(out.value.body_shape, "");
        assert_eq!(out.value.estimated_height, "168");
        assert_eq!(out.value.makeup_advice, "");
        assert_eq!(out.value.undertone_colors, vec!["#112233", "#445566"]);
    }

    #[tokio::test]
    async fn analyze_rejects_non_object_json() {
        let client = ScriptedClient::new(vec![testing::text("[1, 2]")]);
        let err = analyze(&client, "m", &photo()).await.expect_err("array");
        assert_eq!(err.kind(), PipelineErrorKind::Analysis);
    }

    #[tokio::test]
    async fn analyze_missing_credential_is_configuration() {
        let client = ScriptedClient::new(vec![Err(InferenceError::MissingCredential)]);
        let err = analyze(&client, "m", &photo()).await.expect_err("config");
        assert_eq!(err.kind(), PipelineErrorKind::Configuration);
    }

    #[tokio::test]
    async fn analyze_transport_failure_is_analysis_error() {
        let client = ScriptedClient::new(vec![Err(InferenceError::Http("HTTP 503".into()))]);
        let err = analyze(&client, "m", &photo()).await.expect_err("http");
        assert_eq!(err.kind(), PipelineErrorKind::Analysis);
    }

    #[tokio::test]
    async fn search_parses_fenced_json_and_web_sources() {
        let client = ScriptedClient::new(vec![testing::grounded(
            testing::SEARCH_TEXT,
            &[("Zalando", "https://zalando.de"), ("Zalando", "https://zalando.de")],
        )]);
        let analysis =
            StyleAnalysis::from_value(&serde_json::from_str(testing::ANALYSIS_JSON).unwrap());
        let out = search(&client, "m", &analysis).await.expect("search");
        assert_eq!(out.value.outfits.len(), 2);
        assert_eq!(out.value.outfits[0].items[1].merchant_url, None);
        // duplicates are kept, the chunk without a web reference is dropped
        assert_eq!(out.value.sources.len(), 2);
        assert_eq!(out.output["outfit_count"], json!(2));

        let request = &client.requests()[0];
        assert_eq!(request.mode, GenerationMode::GroundedSearch);
        let prompt = request.prompt().unwrap();
        assert!(prompt.contains("\"bodyShape\":\"hourglass\""));
        assert!(prompt.contains("Zalando, H&M, AboutYou"));
    }

    #[tokio::test]
    async fn search_degrades_on_garbage() {
        let client = ScriptedClient::new(vec![testing::grounded("Sorry, no results today.", &[])]);
        let out = search(&client, "m", &StyleAnalysis::default())
            .await
            .expect("degraded search still succeeds");
        assert!(out.value.outfits.is_empty());
        assert_eq!(out.output["outfit_count"], json!(0));
    }

    #[tokio::test]
    async fn search_without_outfits_key_is_empty() {
        let client = ScriptedClient::new(vec![testing::text("{\"looks\": []}")]);
        let out = search(&client, "m", &StyleAnalysis::default()).await.unwrap();
        assert!(out.value.outfits.is_empty());
    }

    #[tokio::test]
    async fn search_transport_failure_is_search_error() {
        let client = ScriptedClient::new(vec![Err(InferenceError::Http("timeout".into()))]);
        let err = search(&client, "m", &StyleAnalysis::default())
            .await
            .expect_err("search");
        assert_eq!(err.kind(), PipelineErrorKind::Search);
        assert_eq!(err.stage(), SEARCH);
    }

    #[test]
    fn enrich_empty_is_empty() {
        assert!(enrich(&[]).is_empty());
    }

    #[test]
    fn enrich_assigns_ids_links_and_viewer_counts() {
        let raw = vec![
            candidate(vec![RawItem {
                name: "Linen Blazer".into(),
                brand: "Zalando".into(),
                price: "89.95".into(),
                merchant_url: Some("https://www.zalando.de/blazer.html".into()),
                image_keyword: Some("linen blazer".into()),
            }]),
            candidate(vec![]),
        ];
        let enriched = enrich(&raw);
        assert_eq!(enriched[0].id, "search-outfit-0");
        assert_eq!(enriched[1].id, "search-outfit-1");
        for outfit in &enriched {
            assert!((10..=89).contains(&outfit.viewer_count));
        }
        let item = &enriched[0].items[0];
        assert_eq!(item.id, "item-0-0");
        assert_eq!(item.original_url, "https://www.zalando.de/blazer.html");
        assert!(item.affiliate_url.starts_with("https://www.awin1.com/"));
        assert!(item.image_url.ends_with("&fashion=linen%20blazer"));
        assert!(enriched[1].items.is_empty());
    }

    #[test]
    fn enrich_synthesizes_search_url_without_merchant() {
        let raw = vec![candidate(vec![RawItem {
            name: "Wide Trousers".into(),
            brand: "H&M".into(),
            price: "34.99".into(),
            merchant_url: None,
            image_keyword: None,
        }])];
        let item = &enrich(&raw)[0].items[0];
        assert_eq!(
            item.original_url,
            "https://www.google.com/search?q=H%26M%20Wide%20Trousers"
        );
        assert_eq!(
            item.affiliate_url,
            "https://www.google.com/search?q=H%26M%20Wide%20Trousers&affiliate_id=HM_PARTNER_99&utm_source=vogue_ai"
        );
        assert!(item.image_url.ends_with("&fashion=Wide%20Trousers"));
    }

    fn enriched_outfit() -> EnrichedOutfit {
        enrich(&[candidate(vec![RawItem {
            name: "Slip Dress".into(),
            brand: "AboutYou".into(),
            price: "59.90".into(),
            merchant_url: None,
            image_keyword: None,
        }])])
        .remove(0)
    }

    #[tokio::test]
    async fn render_returns_first_image_and_adds_makeup() {
        let client = ScriptedClient::new(vec![testing::image(&[7, 7, 7])]);
        let out = render(&client, "img", &photo(), &enriched_outfit(), Some("coral lips"))
            .await
            .expect("render");
        assert_eq!(out.value.bytes, vec![7, 7, 7]);
        let request = &client.requests()[0];
        assert_eq!(request.mode, GenerationMode::FreeText);
        let prompt = request.prompt().unwrap();
        assert!(prompt.contains("\"Look\""));
        assert!(prompt.contains("Slip Dress by AboutYou"));
        assert!(prompt.contains("coral lips"));
    }

    #[tokio::test]
    async fn render_keeps_first_of_several_images() {
        let mut reply = testing::image(&[1]).expect("reply");
        reply.inline_images.push(SessionImage {
            mime_type: "image/webp".into(),
            bytes: vec![2],
        });
        let client = ScriptedClient::new(vec![Ok(reply)]);
        let out = render(&client, "img", &photo(), &enriched_outfit(), None)
            .await
            .expect("render");
        assert_eq!(out.value.bytes, vec![1]);
        assert_eq!(out.value.mime_type, "image/png");
    }

    #[tokio::test]
    async fn render_without_image_is_unavailable() {
        let client = ScriptedClient::new(vec![testing::text("I cannot do that.")]);
        let err = render(&client, "img", &photo(), &enriched_outfit(), None)
            .await
            .expect_err("no image");
        assert_eq!(err.kind(), PipelineErrorKind::RenderUnavailable);
        assert!(!client.requests()[0].prompt().unwrap().contains("make-up"));
    }
}
