use std::{ops::ControlFlow, sync::Arc};

use async_trait::async_trait;
use tokio::{sync::mpsc, task};

use crate::{
    backend::{Backend, BackendDescriptor, CancelSignal},
    error::BackendError,
    model::GenerationParams,
    normalize::OutputShape,
};

/// A loaded model that decodes one request at a time with blocking calls.
pub trait EagerModel: Send + Sync + 'static {
    /// Tokenizes, runs the decode loop bounded by `max_tokens`, and decodes.
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, BackendError>;

    /// Like [`EagerModel::generate`], reporting the decoded text so far after
    /// each step. Decoding stops early when `on_text` breaks.
    ///
    /// The default reports once, with the finished text.
    fn generate_with_progress(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_text: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<String, BackendError> {
        let text = self.generate(prompt, params)?;
        if on_text(&text).is_break() {
            return Err(BackendError::Cancelled);
        }
        Ok(text)
    }
}

/// Whether the model's decoded output repeats the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EagerVariant {
    /// Decodes prompt and completion together (the CPU deployment).
    PromptIncluded,
    /// Decodes only the new tokens (the GPU deployment).
    PromptExcluded,
}

impl EagerVariant {
    fn id(self) -> &'static str {
        match self {
            EagerVariant::PromptIncluded => "eager-cpu",
            EagerVariant::PromptExcluded => "eager-gpu",
        }
    }

    fn output_shape(self) -> OutputShape {
        match self {
            EagerVariant::PromptIncluded => OutputShape::PromptIncluded,
            EagerVariant::PromptExcluded => OutputShape::CompletionOnly,
        }
    }
}

/// Runs an [`EagerModel`] on the blocking pool so decode loops never stall
/// the async runtime.
pub struct EagerAdapter<M> {
    model: Arc<M>,
    descriptor: BackendDescriptor,
}

impl<M: EagerModel> EagerAdapter<M> {
    pub fn new(
        model: M,
        variant: EagerVariant,
        device: impl Into<String>,
        model_path: impl Into<String>,
    ) -> Self {
        Self {
            model: Arc::new(model),
            descriptor: BackendDescriptor {
                id: variant.id().to_string(),
                device: device.into(),
                model_path: model_path.into(),
                output_shape: variant.output_shape(),
                supports_streaming: true,
                internal_batching: false,
            },
        }
    }
}

#[async_trait]
impl<M: EagerModel> Backend for EagerAdapter<M> {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<String, BackendError> {
        let model = self.model.clone();
        let prompt = prompt.to_owned();
        let params = params.clone();
        let cancel = cancel.clone();
        let stop_if_dropped = cancel.cancel_on_drop();

        let outcome = task::spawn_blocking(move || {
            let mut on_text = |_: &str| keep_going(&cancel);
            model.generate_with_progress(&prompt, &params, &mut on_text)
        })
        .await;
        stop_if_dropped.disarm();
        outcome.map_err(join_failure)?
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
        snapshots: mpsc::Sender<String>,
        cancel: &CancelSignal,
    ) -> Result<String, BackendError> {
        let model = self.model.clone();
        let prompt = prompt.to_owned();
        let params = params.clone();
        let cancel = cancel.clone();
        let stop_if_dropped = cancel.cancel_on_drop();

        let outcome = task::spawn_blocking(move || {
            let mut on_text = |text: &str| {
                if keep_going(&cancel).is_break() {
                    return ControlFlow::Break(());
                }
                match snapshots.blocking_send(text.to_owned()) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                }
            };
            model.generate_with_progress(&prompt, &params, &mut on_text)
        })
        .await;
        stop_if_dropped.disarm();
        outcome.map_err(join_failure)?
    }
}

fn keep_going(cancel: &CancelSignal) -> ControlFlow<()> {
    if cancel.is_cancelled() {
        ControlFlow::Break(())
    } else {
        ControlFlow::Continue(())
    }
}

fn join_failure(err: task::JoinError) -> BackendError {
    if err.is_panic() {
        BackendError::Execution("model execution panicked".into())
    } else {
        BackendError::Execution(format!("inference task failed: {err}"))
    }
}
