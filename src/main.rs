mod affiliate;
mod config;
mod consent;
mod http;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod repair;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use consent::{ConsentStore, MemoryConsentStore};
use llm::{GeminiClient, GeminiConfig, InferenceClient};
use models::{ApiError, SessionSnapshot};
use pipeline::{Orchestrator, PipelineConfig, PipelineError, PipelineErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "stylist.api", "bridge crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let gemini = GeminiConfig::from_env();
    if gemini.api_key.is_none() {
        warn!(
            target = "stylist.api",
            "no API_KEY configured; workflow runs will report a configuration error"
        );
    }
    let state = AppState {
        orchestrator: Orchestrator::new(PipelineConfig::default(), GeminiClient::new(gemini)),
        consent: Arc::new(MemoryConsentStore::default()),
    };
    info!(
        target = "stylist.api",
        text_model = %state.orchestrator.config.text_model,
        image_model = %state.orchestrator.config.image_model,
        "pipeline configured"
    );

    let app = router(state);
    let addr = bind_addr_from_env();
    info!(target = "stylist.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

struct AppState<C> {
    orchestrator: Orchestrator<C>,
    consent: Arc<dyn ConsentStore>,
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            consent: self.consent.clone(),
        }
    }
}

/// Routes the browser front end uses to drive a session.
fn router<C: InferenceClient + 'static>(state: AppState<C>) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/session", get(get_session::<C>))
        .route("/session/image", post(submit_image::<C>))
        .route("/session/try-on", post(try_on::<C>))
        .route("/session/makeup", post(toggle_makeup::<C>))
        .route("/session/reset", post(reset_session::<C>))
        .route("/session/error/dismiss", post(dismiss_error::<C>))
        .route("/consent", get(get_consent::<C>).put(put_consent::<C>))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_from_env()))
}

fn bind_addr_from_env() -> SocketAddr {
    if let Some(addr) = std::env::var("STYLIST_BIND")
        .ok()
        .and_then(|value| value.parse::<SocketAddr>().ok())
    {
        return addr;
    }
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    ([127, 0, 0, 1], port).into()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(10 * 1024 * 1024)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "stylist-api",
    }))
}

async fn get_session<C: InferenceClient + 'static>(
    State(state): State<AppState<C>>,
) -> Json<SessionSnapshot> {
    Json(state.orchestrator.snapshot().await)
}

/// Start a workflow run with the uploaded photo.
///
/// - Method: `POST`
/// - Path: `/session/image`
/// - Body: raw image bytes; `Content-Type` names the image type
/// - Response: `SessionSnapshot` once the run has finished
async fn submit_image<C: InferenceClient + 'static>(
    State(state): State<AppState<C>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SessionSnapshot>, AppError> {
    crate::metrics::inc_requests("/session/image");
    let mime_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| v.starts_with("image/"))
        .unwrap_or_else(|| "image/jpeg".to_string());
    let snapshot = state
        .orchestrator
        .submit_image(body.to_vec(), mime_type)
        .await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TryOnRequest {
    outfit_id: String,
}

/// Render the session photo wearing one of the listed outfits.
///
/// - Method: `POST`
/// - Path: `/session/try-on`
/// - Body: `{"outfitId": "search-outfit-0"}`
async fn try_on<C: InferenceClient + 'static>(
    State(state): State<AppState<C>>,
    Json(req): Json<TryOnRequest>,
) -> Result<Json<SessionSnapshot>, AppError> {
    crate::metrics::inc_requests("/session/try-on");
    let snapshot = state
        .orchestrator
        .select_outfit_for_try_on(&req.outfit_id)
        .await?;
    Ok(Json(snapshot))
}

async fn toggle_makeup<C: InferenceClient + 'static>(
    State(state): State<AppState<C>>,
) -> Json<SessionSnapshot> {
    Json(state.orchestrator.toggle_makeup().await)
}

async fn reset_session<C: InferenceClient + 'static>(
    State(state): State<AppState<C>>,
) -> Json<SessionSnapshot> {
    crate::metrics::inc_requests("/session/reset");
    Json(state.orchestrator.reset().await)
}

async fn dismiss_error<C: InferenceClient + 'static>(
    State(state): State<AppState<C>>,
) -> Json<SessionSnapshot> {
    Json(state.orchestrator.dismiss_error().await)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsentBody {
    consent_given: bool,
}

async fn get_consent<C: InferenceClient + 'static>(
    State(state): State<AppState<C>>,
) -> Json<ConsentBody> {
    Json(ConsentBody {
        consent_given: state.consent.get(),
    })
}

async fn put_consent<C: InferenceClient + 'static>(
    State(state): State<AppState<C>>,
    Json(body): Json<ConsentBody>,
) -> Json<ConsentBody> {
    state.consent.set(body.consent_given);
    Json(ConsentBody {
        consent_given: state.consent.get(),
    })
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::InvalidTransition => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.user_message()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{self, ScriptedClient};
    use crate::llm::{GenerateResponse, InferenceError};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(replies: Vec<Result<GenerateResponse, InferenceError>>) -> Router {
        router(AppState {
            orchestrator: Orchestrator::new(
                PipelineConfig {
                    text_model: "text-model".into(),
                    image_model: "image-model".into(),
                },
                ScriptedClient::new(replies),
            ),
            consent: Arc::new(MemoryConsentStore::default()),
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    fn post_image(bytes: &[u8]) -> Request<Body> {
        Request::post("/session/image")
            .header(CONTENT_TYPE, "image/png")
            .body(Body::from(bytes.to_vec()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(vec![]);
        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
    }

    #[tokio::test]
    async fn session_starts_idle() {
        let app = app(vec![]);
        let (status, body) = send(&app, Request::get("/session").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("IDLE"));
        assert_eq!(body["outfits"], json!([]));
        assert_eq!(body["analysis"], Value::Null);
    }

    #[tokio::test]
    async fn image_upload_runs_workflow_and_try_on_failure_keeps_results() {
        let app = app(vec![
            testing::text(testing::ANALYSIS_JSON),
            testing::grounded(testing::SEARCH_TEXT, &[("Zalando", "https://zalando.de")]),
            testing::text("no image for you"),
        ]);
        let (status, body) = send(&app, post_image(&[1, 2, 3])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("RESULTS"));
        assert_eq!(body["outfits"][0]["id"], json!("search-outfit-0"));
        assert_eq!(body["sources"][0]["uri"], json!("https://zalando.de"));
        assert_eq!(body["tryOnImage"], Value::Null);
        assert_eq!(body["applyMakeup"], json!(false));
        assert_eq!(body["stages"][0]["name"], json!("analyze_style"));
        assert!(body["stages"][0]["elapsed_ms"].is_number());
        assert!(body["outfits"][0]["items"][0]["affiliateUrl"]
            .as_str()
            .unwrap()
            .starts_with("https://www.awin1.com/"));

        let (status, body) = send(
            &app,
            post_json("/session/try-on", json!({ "outfitId": "search-outfit-0" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("RESULTS"));
        assert_eq!(body["error"], json!("Virtual try-on is currently unavailable."));
        assert_eq!(body["selectedOutfitId"], json!("search-outfit-0"));
    }

    #[tokio::test]
    async fn try_on_from_idle_conflicts() {
        let app = app(vec![]);
        let (status, body) = send(
            &app,
            post_json("/session/try-on", json!({ "outfitId": "search-outfit-0" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("try_on"));
    }

    #[tokio::test]
    async fn try_on_body_uses_camel_case() {
        let app = app(vec![]);
        let response = app
            .oneshot(post_json(
                "/session/try-on",
                json!({ "outfit_id": "search-outfit-0" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn empty_upload_is_bad_request() {
        let app = app(vec![]);
        let (status, _) = send(&app, post_image(&[])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reset_twice_stays_idle() {
        let app = app(vec![]);
        let (_, first) = send(&app, post_empty("/session/reset")).await;
        let (_, second) = send(&app, post_empty("/session/reset")).await;
        assert_eq!(first["state"], json!("IDLE"));
        assert_eq!(second["state"], json!("IDLE"));
        assert_eq!(second["error"], Value::Null);
    }

    #[tokio::test]
    async fn makeup_toggle_flips_flag() {
        let app = app(vec![]);
        let (_, body) = send(&app, post_empty("/session/makeup")).await;
        assert_eq!(body["applyMakeup"], json!(true));
        let (_, body) = send(&app, post_empty("/session/makeup")).await;
        assert_eq!(body["applyMakeup"], json!(false));
    }

    #[tokio::test]
    async fn consent_round_trip() {
        let app = app(vec![]);
        let (_, body) = send(&app, Request::get("/consent").body(Body::empty()).unwrap()).await;
        assert_eq!(body["consentGiven"], json!(false));
        let request = Request::put("/consent")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "consentGiven": true }).to_string()))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["consentGiven"], json!(true));
    }
}
