pub mod stages;

use crate::config::{IMAGE_MODEL, TEXT_MODEL};
use crate::llm::InferenceClient;
use crate::models::{
    EnrichedOutfit, GroundingSource, SessionImage, SessionSnapshot, StageReport, StyleAnalysis,
    WorkflowState,
};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct PipelineConfig {
    pub text_model: String,
    pub image_model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            text_model: TEXT_MODEL.clone(),
            image_model: IMAGE_MODEL.clone(),
        }
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// No inference credential. Fatal to the run.
    Configuration,
    Analysis,
    Search,
    /// Try-on produced no image. The session stays in Results.
    RenderUnavailable,
    InvalidInput,
    InvalidTransition,
}

impl PipelineError {
    pub fn new(stage: &'static str, kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn configuration(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Configuration, message)
    }

    pub fn analysis(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Analysis, message)
    }

    pub fn search(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Search, message)
    }

    pub fn render_unavailable(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::RenderUnavailable, message)
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::InvalidInput, message)
    }

    pub fn invalid_transition(stage: &'static str, from: WorkflowState) -> Self {
        Self::new(
            stage,
            PipelineErrorKind::InvalidTransition,
            format!("not allowed while {}", from.as_str()),
        )
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    /// The text shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self.kind {
            PipelineErrorKind::Configuration => {
                "No API key is configured. Set API_KEY and restart the stylist.".into()
            }
            PipelineErrorKind::Analysis => {
                "We could not analyse your photo. Please check your connection and try again."
                    .into()
            }
            PipelineErrorKind::Search => {
                "The live outfit search failed. Please try again.".into()
            }
            PipelineErrorKind::RenderUnavailable => {
                "Virtual try-on is currently unavailable.".into()
            }
            PipelineErrorKind::InvalidInput | PipelineErrorKind::InvalidTransition => {
                self.message.clone()
            }
        }
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// Everything a workflow run accumulates. Owned by [`Orchestrator`] only.
#[derive(Default)]
struct Session {
    state: WorkflowState,
    run_id: Option<Uuid>,
    user_image: Option<SessionImage>,
    analysis: Option<StyleAnalysis>,
    outfits: Vec<EnrichedOutfit>,
    sources: Vec<GroundingSource>,
    selected_outfit: Option<EnrichedOutfit>,
    try_on_image: Option<SessionImage>,
    apply_makeup: bool,
    error: Option<String>,
    stages: Vec<StageReport>,
}

impl Session {
    fn clear(&mut self) {
        *self = Session {
            apply_makeup: self.apply_makeup,
            ..Session::default()
        };
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            analysis: self.analysis.clone(),
            outfits: self.outfits.clone(),
            sources: self.sources.clone(),
            try_on_image: self.try_on_image.as_ref().map(SessionImage::to_data_url),
            selected_outfit_id: self.selected_outfit.as_ref().map(|o| o.id.clone()),
            apply_makeup: self.apply_makeup,
            error: self.error.clone(),
            stages: self.stages.clone(),
        }
    }

    fn makeup_directive(&self) -> Option<String> {
        if !self.apply_makeup {
            return None;
        }
        self.analysis
            .as_ref()
            .map(|analysis| analysis.makeup_advice.trim().to_string())
            .filter(|advice| !advice.is_empty())
    }
}

struct RunOutput {
    analysis: StyleAnalysis,
    outfits: Vec<EnrichedOutfit>,
    sources: Vec<GroundingSource>,
}

/// Sequences analysis, grounded search and enrichment, and runs try-on on
/// request. State changes only happen once a stage has completed; a result
/// arriving after a reset is dropped.
pub struct Orchestrator<C> {
    pub config: Arc<PipelineConfig>,
    client: Arc<C>,
    session: Arc<Mutex<Session>>,
}

impl<C> Clone for Orchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            client: self.client.clone(),
            session: self.session.clone(),
        }
    }
}

impl<C: InferenceClient> Orchestrator<C> {
    pub fn new(config: PipelineConfig, client: C) -> Self {
        Self {
            config: Arc::new(config),
            client: Arc::new(client),
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().await.snapshot()
    }

    /// Idle → Analyzing → Results, or back to Idle with an error.
    pub async fn submit_image(
        &self,
        bytes: Vec<u8>,
        mime_type: impl Into<String>,
    ) -> Result<SessionSnapshot, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::invalid_input("submit_image", "empty image"));
        }
        let image = SessionImage {
            mime_type: mime_type.into(),
            bytes,
        };

        let run_id = {
            let mut session = self.session.lock().await;
            if session.state != WorkflowState::Idle {
                return Err(PipelineError::invalid_transition(
                    "submit_image",
                    session.state,
                ));
            }
            let run_id = Uuid::new_v4();
            session.clear();
            session.state = WorkflowState::Analyzing;
            session.run_id = Some(run_id);
            session.user_image = Some(image.clone());
            run_id
        };
        info!(target = "stylist.pipeline", %run_id, mime_type = %image.mime_type, "workflow_started");

        let mut reports = Vec::new();
        let result = self.run_workflow(&image, &mut reports).await;

        let mut session = self.session.lock().await;
        if session.run_id != Some(run_id) {
            info!(target = "stylist.pipeline", %run_id, "workflow_result_discarded");
            return Ok(session.snapshot());
        }
        session.stages = reports;
        match result {
            Ok(output) => {
                info!(
                    target = "stylist.pipeline",
                    %run_id,
                    outfits = output.outfits.len(),
                    sources = output.sources.len(),
                    "workflow_completed"
                );
                session.analysis = Some(output.analysis);
                session.outfits = output.outfits;
                session.sources = output.sources;
                session.state = WorkflowState::Results;
            }
            Err(err) => {
                error!(
                    target = "stylist.pipeline",
                    %run_id,
                    stage = err.stage(),
                    kind = ?err.kind(),
                    error = %err,
                    "workflow_failed"
                );
                let reports = std::mem::take(&mut session.stages);
                session.clear();
                session.stages = reports;
                session.error = Some(err.user_message());
            }
        }
        Ok(session.snapshot())
    }

    async fn run_workflow(
        &self,
        image: &SessionImage,
        reports: &mut Vec<StageReport>,
    ) -> Result<RunOutput, PipelineError> {
        let client = self.client.as_ref();
        let text_model = self.config.text_model.as_str();

        let analysis = self
            .capture_stage(
                stages::ANALYZE,
                reports,
                stages::analyze(client, text_model, image),
            )
            .await?;

        let found = self
            .capture_stage(
                stages::SEARCH,
                reports,
                stages::search(client, text_model, &analysis),
            )
            .await?;

        let outfits = self
            .capture_stage(stages::ENRICH, reports, async {
                let outfits = stages::enrich(&found.outfits);
                let item_count: usize = outfits.iter().map(|o| o.items.len()).sum();
                Ok(StageOutcome::new(
                    outfits,
                    json!({ "outfit_count": found.outfits.len(), "item_count": item_count }),
                ))
            })
            .await?;

        Ok(RunOutput {
            analysis,
            outfits,
            sources: found.sources,
        })
    }

    /// Results → TryingOn → Results. Failure keeps the current results.
    pub async fn select_outfit_for_try_on(
        &self,
        outfit_id: &str,
    ) -> Result<SessionSnapshot, PipelineError> {
        let (run_id, image, outfit, makeup) = {
            let mut session = self.session.lock().await;
            if session.state != WorkflowState::Results {
                return Err(PipelineError::invalid_transition("try_on", session.state));
            }
            let outfit = session
                .outfits
                .iter()
                .find(|outfit| outfit.id == outfit_id)
                .cloned()
                .ok_or_else(|| {
                    PipelineError::invalid_input("try_on", format!("unknown outfit `{outfit_id}`"))
                })?;
            let image = session
                .user_image
                .clone()
                .ok_or_else(|| PipelineError::invalid_input("try_on", "no photo in session"))?;
            let makeup = session.makeup_directive();
            session.selected_outfit = Some(outfit.clone());
            session.error = None;
            session.state = WorkflowState::TryingOn;
            (session.run_id, image, outfit, makeup)
        };

        let mut reports = Vec::new();
        let result = self
            .capture_stage(
                stages::RENDER,
                &mut reports,
                stages::render(
                    self.client.as_ref(),
                    &self.config.image_model,
                    &image,
                    &outfit,
                    makeup.as_deref(),
                ),
            )
            .await;

        let mut session = self.session.lock().await;
        if session.run_id != run_id || session.state != WorkflowState::TryingOn {
            info!(target = "stylist.pipeline", outfit_id, "try_on_result_discarded");
            return Ok(session.snapshot());
        }
        session.stages.extend(reports);
        match result {
            Ok(rendered) => {
                session.try_on_image = Some(rendered);
            }
            Err(err) => {
                warn!(
                    target = "stylist.pipeline",
                    outfit_id,
                    kind = ?err.kind(),
                    error = %err,
                    "try_on_failed"
                );
                session.error = Some(err.user_message());
            }
        }
        session.state = WorkflowState::Results;
        Ok(session.snapshot())
    }

    /// Back to Idle, dropping everything the run produced.
    pub async fn reset(&self) -> SessionSnapshot {
        let mut session = self.session.lock().await;
        if session.state != WorkflowState::Idle || session.run_id.is_some() {
            info!(target = "stylist.pipeline", from = session.state.as_str(), "session_reset");
        }
        session.clear();
        session.snapshot()
    }

    pub async fn toggle_makeup(&self) -> SessionSnapshot {
        let mut session = self.session.lock().await;
        session.apply_makeup = !session.apply_makeup;
        session.snapshot()
    }

    pub async fn dismiss_error(&self) -> SessionSnapshot {
        let mut session = self.session.lock().await;
        session.error = None;
        session.snapshot()
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        reports: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        match outcome {
            Ok(outcome) => {
                reports.push(StageReport::new(name, elapsed_ms, outcome.output));
                Ok(outcome.value)
            }
            Err(err) => {
                reports.push(StageReport::new(
                    name,
                    elapsed_ms,
                    json!({ "error": err.detail(), "kind": format!("{:?}", err.kind()) }),
                ));
                Err(err)
            }
        }
    }
}
