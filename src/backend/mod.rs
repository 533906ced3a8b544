//! Generation backends behind one contract.
//!
//! A backend reports raw text in the [`OutputShape`] it declares; turning that
//! into canonical output is the normalizer's job, not the backend's.

mod batching;
mod dummy;
mod eager;

#[cfg(feature = "tch-backend")]
pub mod torch;

use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, mpsc};

use crate::{
    config::{AppConfig, BackendKind},
    error::{BackendError, ServiceError},
    model::GenerationParams,
    normalize::OutputShape,
};

pub use batching::{BatchingAdapter, BatchingEngine, PartialOutput};
pub use dummy::{DUMMY_MODEL_ID, DummyEngine, DummyModel};
pub use eager::{EagerAdapter, EagerModel, EagerVariant};

/// Static facts about a backend, fixed when it is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub device: String,
    pub model_path: String,
    pub output_shape: OutputShape,
    pub supports_streaming: bool,
    /// Whether the engine interleaves concurrent requests itself. Backends
    /// without it execute one request at a time.
    pub internal_batching: bool,
}

/// Cooperative cancellation of one generation.
///
/// Firing it asks the backend to stop at its next step. A backend future
/// resolves only once the model is no longer working on the request, so the
/// caller can keep its concurrency slot until then.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<CancelState>);

#[derive(Debug, Default)]
struct CancelState {
    fired: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.fired.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.fired.load(Ordering::Acquire)
    }

    /// Resolves once [`CancelSignal::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut notified = pin!(self.0.notify.notified());
        // registered before the check so a concurrent cancel is not missed
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Fires the signal if the returned guard is dropped while still armed.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop(Some(self.clone()))
    }
}

pub struct CancelOnDrop(Option<CancelSignal>);

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel.cancel();
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Runs one generation and returns its raw text. Once `cancel` fires the
    /// backend stops as soon as it can and returns [`BackendError::Cancelled`].
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<String, BackendError>;

    /// Runs one streamed generation, sending cumulative raw snapshots in
    /// order, and returns the final raw text. Returns
    /// [`BackendError::Cancelled`] once the receiver is gone or `cancel` fires.
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
        snapshots: mpsc::Sender<String>,
        cancel: &CancelSignal,
    ) -> Result<String, BackendError>;
}

/// Loads the model named by the config and wraps it in its adapter. Blocks
/// for as long as the weights take to load.
pub fn load_backend(config: &AppConfig) -> Result<Box<dyn Backend>, ServiceError> {
    let device = config.device.clone();
    let model_path = config.model_id.clone();

    if config.model_id == DUMMY_MODEL_ID {
        let delay = Duration::from_millis(config.dummy_token_delay_ms);
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::EagerCpu => Box::new(EagerAdapter::new(
                DummyModel::new(true).with_token_delay(delay),
                EagerVariant::PromptIncluded,
                device,
                model_path,
            )),
            BackendKind::EagerGpu => Box::new(EagerAdapter::new(
                DummyModel::new(false).with_token_delay(delay),
                EagerVariant::PromptExcluded,
                device,
                model_path,
            )),
            BackendKind::Batching => Box::new(BatchingAdapter::new(
                DummyEngine::new(delay),
                device,
                model_path,
            )),
        };
        return Ok(backend);
    }

    match config.backend {
        BackendKind::Batching => Err(ServiceError::ModelLoad(format!(
            "no continuous-batching engine is available for `{}`",
            config.model_id
        ))),
        #[cfg(feature = "tch-backend")]
        kind => torch::load(config, kind),
        #[cfg(not(feature = "tch-backend"))]
        _ => Err(ServiceError::ModelLoad(format!(
            "cannot load `{}`: built without the tch-backend feature",
            config.model_id
        ))),
    }
}
