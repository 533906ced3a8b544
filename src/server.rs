use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::{AppConfig, BackendKind, GenerationDefaults},
    deployment::{DeploymentInstance, DeploymentStatus},
    error::ServiceError,
    model::GenerationResult,
    streaming::event_stream,
    validation::parse_generation_request,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    deployment: Arc<OnceCell<Arc<DeploymentInstance>>>,
}

impl AppState {
    /// State for a server whose model is still loading.
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            deployment: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_deployment(config: Arc<AppConfig>, deployment: Arc<DeploymentInstance>) -> Self {
        let state = Self::new(config);
        state.install(deployment);
        state
    }

    /// Makes the deployment visible to handlers. Only the first call wins.
    pub fn install(&self, deployment: Arc<DeploymentInstance>) -> bool {
        self.deployment.set(deployment).is_ok()
    }

    pub fn deployment(&self) -> Result<&Arc<DeploymentInstance>, ServiceError> {
        self.deployment.get().ok_or(ServiceError::ModelLoading)
    }
}

#[derive(Serialize)]
struct MetadataResponse<'a> {
    ready: bool,
    model_id: &'a str,
    backend: BackendKind,
    generation: &'a GenerationDefaults,
    deployment: Option<DeploymentStatus>,
}

/// Response body of a non-streaming generation.
#[derive(Serialize)]
#[serde(untagged)]
enum GenerationResponse {
    Completed {
        prompt: String,
        generated_text: String,
        inference_time_seconds: f64,
        backend_id: String,
        device_used: String,
        model_path: String,
    },
    Failed {
        error: String,
        backend_id: String,
        device_used: String,
        model_path: String,
    },
}

impl IntoResponse for GenerationResult {
    fn into_response(self) -> Response {
        let status = self
            .failure_kind
            .map(|kind| kind.status_code())
            .unwrap_or(StatusCode::OK);
        let body = match self.error {
            None => GenerationResponse::Completed {
                prompt: self.prompt,
                generated_text: self.generated_text,
                inference_time_seconds: self.inference_time_seconds,
                backend_id: self.backend_id,
                device_used: self.device_used,
                model_path: self.model_path,
            },
            Some(error) => GenerationResponse::Failed {
                error,
                backend_id: self.backend_id,
                device_used: self.device_used,
                model_path: self.model_path,
            },
        };
        (status, Json(body)).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(generate))
        .route("/generate", post(generate))
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn generate(State(state): State<AppState>, body: Bytes) -> Result<Response, ServiceError> {
    let request = parse_generation_request(&body, &state.config.generation)?;
    let deployment = state.deployment()?.clone();

    if request.stream {
        let events = deployment.handle_stream(request).await?;
        return Ok(event_stream(events).into_response());
    }

    let result = deployment.handle(request).await?;
    Ok(result.into_response())
}

async fn metadata(State(state): State<AppState>) -> Response {
    let deployment = state.deployment().ok().map(|deployment| deployment.status());

    Json(MetadataResponse {
        ready: deployment.is_some(),
        model_id: &state.config.model_id,
        backend: state.config.backend,
        generation: &state.config.generation,
        deployment,
    })
    .into_response()
}
