use serde::Serialize;

use crate::error::{FailureKind, GenerationFailure};

/// A validated inference request. Built by the router; never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
    pub stream: bool,
}

impl GenerationRequest {
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
        }
    }
}

/// Sampling parameters as handed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
}

/// Canonical outcome of one generation. Exactly one of `generated_text` and
/// `error` carries content once a failure is recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub prompt: String,
    pub generated_text: String,
    pub inference_time_seconds: f64,
    pub backend_id: String,
    pub device_used: String,
    pub model_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub failure_kind: Option<FailureKind>,
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn record_failure(&mut self, failure: &GenerationFailure) {
        self.generated_text.clear();
        self.error = Some(failure.to_string());
        self.failure_kind = Some(failure.kind());
    }
}

/// One streamed increment of generated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenDelta {
    pub text_fragment: String,
    pub is_final: bool,
}

impl TokenDelta {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            text_fragment: text.into(),
            is_final: false,
        }
    }
}

/// Events of a streaming session, in generation order. `Final` is always the
/// last event of a session that was not abandoned by its client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(TokenDelta),
    Final(GenerationResult),
}
