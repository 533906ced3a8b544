//! Deterministic stand-ins for real weights, selected with `MODEL_ID=dummy`.

use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    backend::{BatchingEngine, EagerModel, PartialOutput},
    error::BackendError,
    model::GenerationParams,
};

pub const DUMMY_MODEL_ID: &str = "dummy";

const BLANK_PROMPT_REPLY: &str = "nothing to repeat";

/// The completion "tokens": the prompt's words upper-cased, capped at `max_tokens`.
fn completion_tokens(prompt: &str, max_tokens: usize) -> Vec<String> {
    let source = if prompt.trim().is_empty() {
        BLANK_PROMPT_REPLY
    } else {
        prompt
    };
    source
        .split_whitespace()
        .take(max_tokens)
        .map(str::to_uppercase)
        .collect()
}

/// Eager dummy. With `echo_prompt` its decoded output starts with the prompt,
/// like a causal LM decoding prompt and completion together.
pub struct DummyModel {
    echo_prompt: bool,
    token_delay: Duration,
}

impl DummyModel {
    pub fn new(echo_prompt: bool) -> Self {
        Self {
            echo_prompt,
            token_delay: Duration::ZERO,
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    fn decode(&self, prompt: &str, tokens: &[String]) -> String {
        let completion = tokens.join(" ");
        if self.echo_prompt {
            format!("{prompt} {completion}")
        } else {
            completion
        }
    }
}

impl EagerModel for DummyModel {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, BackendError> {
        self.generate_with_progress(prompt, params, &mut |_| ControlFlow::Continue(()))
    }

    fn generate_with_progress(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_text: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<String, BackendError> {
        let tokens = completion_tokens(prompt, params.max_tokens);
        for produced in 1..=tokens.len() {
            if !self.token_delay.is_zero() {
                thread::sleep(self.token_delay);
            }
            if on_text(&self.decode(prompt, &tokens[..produced])).is_break() {
                return Err(BackendError::Cancelled);
            }
        }
        Ok(self.decode(prompt, &tokens))
    }
}

/// Batching dummy: one tokio task per request, each step reporting the
/// cumulative completion.
#[derive(Default)]
pub struct DummyEngine {
    token_delay: Duration,
    running: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl DummyEngine {
    pub fn new(token_delay: Duration) -> Self {
        Self {
            token_delay,
            running: Arc::default(),
        }
    }

    pub fn running_requests(&self) -> usize {
        self.running.lock().len()
    }
}

#[async_trait]
impl BatchingEngine for DummyEngine {
    async fn submit(
        &self,
        request_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<mpsc::Receiver<Result<PartialOutput, BackendError>>, BackendError> {
        let (tx, rx) = mpsc::channel(16);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.running
            .lock()
            .insert(request_id.to_string(), cancelled.clone());

        let tokens = completion_tokens(prompt, params.max_tokens);
        let delay = self.token_delay;
        let running = self.running.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            for produced in 1..=tokens.len() {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if cancelled.load(Ordering::Acquire) {
                    break;
                }
                let step = PartialOutput {
                    text: tokens[..produced].join(" "),
                    finished: produced == tokens.len(),
                };
                if tx.send(Ok(step)).await.is_err() {
                    break;
                }
            }
            running.lock().remove(&request_id);
        });
        Ok(rx)
    }

    async fn abort(&self, request_id: &str) -> Result<(), BackendError> {
        if let Some(flag) = self.running.lock().remove(request_id) {
            flag.store(true, Ordering::Release);
        }
        Ok(())
    }
}
