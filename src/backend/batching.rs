use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    backend::{Backend, BackendDescriptor, CancelSignal},
    error::BackendError,
    model::GenerationParams,
    normalize::OutputShape,
};

/// One step reported by a continuous-batching engine. `text` is cumulative:
/// everything generated for the request so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialOutput {
    pub text: String,
    pub finished: bool,
}

/// An engine that interleaves the decode steps of many requests.
#[async_trait]
pub trait BatchingEngine: Send + Sync + 'static {
    /// Enqueues a request and returns the receiver of its step outputs. The
    /// engine closes the channel after the finished step.
    async fn submit(
        &self,
        request_id: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<mpsc::Receiver<Result<PartialOutput, BackendError>>, BackendError>;

    /// Drops a request and frees what it holds. Unknown ids are a no-op.
    async fn abort(&self, request_id: &str) -> Result<(), BackendError>;
}

pub struct BatchingAdapter<E> {
    engine: Arc<E>,
    descriptor: BackendDescriptor,
}

impl<E: BatchingEngine> BatchingAdapter<E> {
    pub fn new(engine: E, device: impl Into<String>, model_path: impl Into<String>) -> Self {
        Self {
            engine: Arc::new(engine),
            descriptor: BackendDescriptor {
                id: "batching".to_string(),
                device: device.into(),
                model_path: model_path.into(),
                output_shape: OutputShape::Cumulative,
                supports_streaming: true,
                internal_batching: true,
            },
        }
    }

    /// Drives one engine request to completion. Every step is handed to
    /// `on_step`; the return value is the text of the last step only.
    async fn run<F>(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelSignal,
        mut on_step: F,
    ) -> Result<String, BackendError>
    where
        F: FnMut(&PartialOutput) -> futures::future::BoxFuture<'static, bool> + Send,
    {
        let request_id = format!("req-{}", Uuid::new_v4());
        let mut steps = self.engine.submit(&request_id, prompt, params).await?;
        let mut guard = AbortGuard::new(self.engine.clone(), request_id.clone());

        // Steps are cumulative, so the last one replaces everything before it.
        // Appending them would repeat text once per step.
        let mut last: Option<PartialOutput> = None;
        loop {
            let step = tokio::select! {
                step = steps.recv() => step,
                () = cancel.cancelled() => return Err(BackendError::Cancelled),
            };
            let Some(step) = step else { break };
            let step = step?;
            if !on_step(&step).await {
                return Err(BackendError::Cancelled);
            }
            let finished = step.finished;
            last = Some(step);
            if finished {
                break;
            }
        }
        guard.defuse();

        tracing::debug!(%request_id, "engine request finished");
        Ok(last.map(|step| step.text).unwrap_or_default())
    }
}

#[async_trait]
impl<E: BatchingEngine> Backend for BatchingAdapter<E> {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<String, BackendError> {
        self.run(prompt, params, cancel, |_| Box::pin(async { true })).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
        snapshots: mpsc::Sender<String>,
        cancel: &CancelSignal,
    ) -> Result<String, BackendError> {
        self.run(prompt, params, cancel, move |step| {
            let snapshots = snapshots.clone();
            let text = step.text.clone();
            Box::pin(async move { snapshots.send(text).await.is_ok() })
        })
        .await
    }
}

/// Aborts the engine request if dropped before the generation completed,
/// which happens on cancellation, client disconnect or an error step.
struct AbortGuard<E: BatchingEngine> {
    engine: Option<Arc<E>>,
    request_id: String,
}

impl<E: BatchingEngine> AbortGuard<E> {
    fn new(engine: Arc<E>, request_id: String) -> Self {
        Self {
            engine: Some(engine),
            request_id,
        }
    }

    fn defuse(&mut self) {
        self.engine = None;
    }
}

impl<E: BatchingEngine> Drop for AbortGuard<E> {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        let request_id = std::mem::take(&mut self.request_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Err(err) = engine.abort(&request_id).await {
                tracing::warn!(%request_id, error = %err, "failed to abort engine request");
            } else {
                tracing::debug!(%request_id, "aborted engine request");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn params() -> GenerationParams {
        GenerationParams {
            max_tokens: 16,
            temperature: 0.0,
            top_p: 1.0,
            seed: None,
        }
    }

    /// Replays fixed steps, recording aborts.
    #[derive(Default)]
    struct ScriptedEngine {
        steps: Vec<Result<PartialOutput, BackendError>>,
        hold_open: bool,
        aborted: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedEngine {
        fn cumulative(texts: &[&str]) -> Self {
            let last = texts.len().saturating_sub(1);
            let steps = texts
                .iter()
                .enumerate()
                .map(|(idx, text)| {
                    Ok(PartialOutput {
                        text: text.to_string(),
                        finished: idx == last,
                    })
                })
                .collect();
            Self {
                steps,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl BatchingEngine for ScriptedEngine {
        async fn submit(
            &self,
            _request_id: &str,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<mpsc::Receiver<Result<PartialOutput, BackendError>>, BackendError> {
            let (tx, rx) = mpsc::channel(16);
            let steps = self.steps.clone();
            let hold_open = self.hold_open;
            tokio::spawn(async move {
                for step in steps {
                    if tx.send(step).await.is_err() {
                        return;
                    }
                }
                if hold_open {
                    tx.closed().await;
                }
            });
            Ok(rx)
        }

        async fn abort(&self, request_id: &str) -> Result<(), BackendError> {
            self.aborted.lock().push(request_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn final_cumulative_step_is_the_result() {
        let adapter = BatchingAdapter::new(
            ScriptedEngine::cumulative(&["Hel", "Hello wor", "Hello world"]),
            "cuda",
            "/models/mistral",
        );
        let text = adapter
            .generate("Say hello", &params(), &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(text, "Hello world");
        assert_ne!(text, "HelHello worHello world");
    }

    #[tokio::test]
    async fn no_steps_yield_empty_text() {
        let adapter = BatchingAdapter::new(ScriptedEngine::default(), "cuda", "/m");
        let text = adapter.generate("p", &params(), &CancelSignal::new()).await;
        assert_eq!(text.unwrap(), "");
    }

    #[tokio::test]
    async fn stream_forwards_every_snapshot() {
        let adapter = BatchingAdapter::new(
            ScriptedEngine::cumulative(&["Hel", "Hello wor", "Hello world"]),
            "cuda",
            "/m",
        );
        let (tx, mut rx) = mpsc::channel(8);
        let text = adapter
            .generate_stream("p", &params(), tx, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(text, "Hello world");

        let mut seen = Vec::new();
        while let Some(snapshot) = rx.recv().await {
            seen.push(snapshot);
        }
        assert_eq!(seen, ["Hel", "Hello wor", "Hello world"]);
    }

    #[tokio::test]
    async fn error_step_aborts_request() {
        let engine = ScriptedEngine {
            steps: vec![
                Ok(PartialOutput {
                    text: "Hel".into(),
                    finished: false,
                }),
                Err(BackendError::OutOfMemory("KV cache exhausted".into())),
            ],
            ..ScriptedEngine::default()
        };
        let aborted = engine.aborted.clone();
        let adapter = BatchingAdapter::new(engine, "cuda", "/m");

        let err = adapter
            .generate("p", &params(), &CancelSignal::new())
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::OutOfMemory("KV cache exhausted".into()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let aborted = aborted.lock();
        assert_eq!(aborted.len(), 1);
        assert!(aborted[0].starts_with("req-"));
    }

    #[tokio::test]
    async fn dropped_generation_aborts_request() {
        let mut engine = ScriptedEngine::cumulative(&["partial"]);
        engine.steps[0].as_mut().unwrap().finished = false;
        engine.hold_open = true;
        let aborted = engine.aborted.clone();
        let adapter = BatchingAdapter::new(engine, "cuda", "/m");

        let cancel = CancelSignal::new();
        let outcome = tokio::time::timeout(
            Duration::from_millis(30),
            adapter.generate("p", &params(), &cancel),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(aborted.lock().len(), 1);
    }

    #[tokio::test]
    async fn completed_generation_is_not_aborted() {
        let engine = ScriptedEngine::cumulative(&["a", "ab"]);
        let aborted = engine.aborted.clone();
        let adapter = BatchingAdapter::new(engine, "cuda", "/m");
        adapter.generate("p", &params(), &CancelSignal::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(aborted.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_aborts_a_running_request() {
        let mut engine = ScriptedEngine::cumulative(&["partial"]);
        engine.steps[0].as_mut().unwrap().finished = false;
        engine.hold_open = true;
        let aborted = engine.aborted.clone();
        let adapter = BatchingAdapter::new(engine, "cuda", "/m");

        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = adapter.generate("p", &params(), &cancel).await.unwrap_err();
        assert_eq!(err, BackendError::Cancelled);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(aborted.lock().len(), 1);
    }
}
