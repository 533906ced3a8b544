//! One loaded model behind a concurrency ceiling.
//!
//! Admission: a request takes a slot from a FIFO-fair semaphore before the
//! backend sees it. Backends that batch internally get the configured ceiling;
//! eager backends get a single slot and everything else waits in line.

use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    backend::{Backend, BackendDescriptor, CancelSignal},
    config::{AdmissionPolicy, DeploymentSettings},
    error::{BackendError, GenerationFailure, ServiceError},
    model::{GenerationRequest, GenerationResult, StreamEvent, TokenDelta},
    normalize::{self, DeltaTracker},
};

const STREAM_BUFFER: usize = 64;

pub struct DeploymentInstance {
    backend: Arc<dyn Backend>,
    settings: DeploymentSettings,
    ceiling: usize,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

/// Point-in-time view of a deployment, for `/metadata`.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub backend: BackendDescriptor,
    pub settings: DeploymentSettings,
    pub ceiling: usize,
    pub in_flight: usize,
    pub queued: usize,
}

impl DeploymentInstance {
    pub fn new(backend: Arc<dyn Backend>, settings: DeploymentSettings) -> Self {
        let requested = settings.max_concurrent_requests.max(1);
        let ceiling = if backend.descriptor().internal_batching {
            requested
        } else {
            1
        };
        Self {
            backend,
            settings,
            ceiling,
            slots: Arc::new(Semaphore::new(ceiling)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        self.backend.descriptor()
    }

    /// Number of requests allowed to execute at once.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn status(&self) -> DeploymentStatus {
        DeploymentStatus {
            backend: self.descriptor().clone(),
            settings: self.settings.clone(),
            ceiling: self.ceiling,
            in_flight: self.in_flight(),
            queued: self.queued(),
        }
    }

    /// Runs one request to completion. Only admission failures are `Err`;
    /// generation failures come back inside the result.
    ///
    /// A request past its deadline is answered right away, but its slot stays
    /// taken until the cancelled backend has actually stopped.
    pub async fn handle(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, ServiceError> {
        let slot = self.acquire_slot().await?;
        let deadline = self.settings.request_timeout;
        let cancel = CancelSignal::new();
        let cancel_if_abandoned = cancel.cancel_on_drop();

        let started = Instant::now();
        let mut generation = tokio::spawn({
            let backend = self.backend.clone();
            let prompt = request.prompt.clone();
            let params = request.params();
            let cancel = cancel.clone();
            async move {
                let _slot = slot;
                backend.generate(&prompt, &params, &cancel).await
            }
        });
        let raw = match timeout(deadline, &mut generation).await {
            Ok(joined) => joined
                .unwrap_or_else(|err| Err(task_failure(err)))
                .map_err(GenerationFailure::from),
            Err(_) => {
                cancel.cancel();
                Err(GenerationFailure::Timeout(deadline))
            }
        };
        let elapsed = started.elapsed();
        cancel_if_abandoned.disarm();

        if let Err(failure) = &raw {
            log_failure(self.descriptor(), &request, failure);
        }
        Ok(normalize::normalize(
            self.descriptor(),
            request.prompt,
            raw,
            elapsed,
        ))
    }

    /// Starts a streaming session and returns its events. The slot is held by
    /// the session task and released when it ends, including when the
    /// receiver is dropped mid-stream.
    pub async fn handle_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ServiceError> {
        if !request.stream {
            return Err(ServiceError::BadRequest(
                "streaming requires `stream: true`".into(),
            ));
        }
        if !self.descriptor().supports_streaming {
            return Err(ServiceError::BadRequest(format!(
                "backend `{}` does not support streaming",
                self.descriptor().id
            )));
        }

        let slot = self.acquire_slot().await?;
        let (events_tx, events_rx) = mpsc::channel(STREAM_BUFFER);
        let backend = self.backend.clone();
        let deadline = self.settings.request_timeout;

        tokio::spawn(async move {
            let _slot = slot;
            run_stream_session(backend, request, deadline, events_tx).await;
        });

        Ok(events_rx)
    }

    async fn acquire_slot(&self) -> Result<SlotGuard, ServiceError> {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => match self.settings.admission {
                AdmissionPolicy::Reject => {
                    return Err(ServiceError::Capacity(format!(
                        "all {} slots are busy",
                        self.ceiling
                    )));
                }
                AdmissionPolicy::Queue => self.wait_for_slot().await?,
            },
        };
        Ok(SlotGuard::new(permit, self.in_flight.clone()))
    }

    async fn wait_for_slot(&self) -> Result<OwnedSemaphorePermit, ServiceError> {
        let position = self.queued.fetch_add(1, Ordering::AcqRel);
        let _queued = CounterGuard(self.queued.clone());
        if let Some(limit) = self.settings.max_queued_requests {
            if position >= limit {
                return Err(ServiceError::Capacity(format!(
                    "all {} slots are busy and {limit} requests are already queued",
                    self.ceiling
                )));
            }
        }
        debug!(position, "request queued for a slot");
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::Internal("deployment is shutting down".into()))
    }
}

async fn run_stream_session(
    backend: Arc<dyn Backend>,
    request: GenerationRequest,
    deadline: Duration,
    events: mpsc::Sender<StreamEvent>,
) {
    let descriptor = backend.descriptor().clone();
    let params = request.params();
    let cancel = CancelSignal::new();

    let started = Instant::now();
    let (raw, elapsed) = {
        let (snapshots_tx, mut snapshots_rx) = mpsc::channel::<String>(STREAM_BUFFER);
        let generation =
            backend.generate_stream(&request.prompt, &params, snapshots_tx, &cancel);
        let mut tracker = DeltaTracker::new(descriptor.output_shape, request.prompt.clone());
        let events = &events;
        let forward = async move {
            while let Some(snapshot) = snapshots_rx.recv().await {
                if let Some(fragment) = tracker.advance(&snapshot) {
                    let delta = StreamEvent::Delta(TokenDelta::fragment(fragment));
                    if events.send(delta).await.is_err() {
                        // dropping the receiver here stops the backend
                        break;
                    }
                }
            }
            tracker
        };

        let mut work = pin!(async { tokio::join!(generation, forward) });
        let outcome = timeout(deadline, work.as_mut()).await;
        let elapsed = started.elapsed();
        let raw = match outcome {
            Ok((raw, tracker)) => raw
                .map(|raw| (raw, tracker))
                .map_err(GenerationFailure::from),
            Err(_) => {
                cancel.cancel();
                // the slot goes back only once the backend has stopped
                let _ = work.await;
                Err(GenerationFailure::Timeout(deadline))
            }
        };
        (raw, elapsed)
    };

    if events.is_closed() {
        debug!(backend = %descriptor.id, "client disconnected, stream abandoned");
        return;
    }

    let text = match raw {
        Ok((raw, mut tracker)) => {
            let (tail, full) = tracker.finish(&raw);
            if let Some(tail) = tail {
                let _ = events.send(StreamEvent::Delta(TokenDelta::fragment(tail))).await;
            }
            Ok(full)
        }
        Err(failure) => {
            log_failure(&descriptor, &request, &failure);
            Err(failure)
        }
    };
    let result = normalize::build_result(&descriptor, request.prompt, text, elapsed);
    let _ = events.send(StreamEvent::Final(result)).await;
}

fn task_failure(err: tokio::task::JoinError) -> BackendError {
    if err.is_panic() {
        BackendError::Execution("generation task panicked".into())
    } else {
        BackendError::Execution(format!("generation task failed: {err}"))
    }
}

fn log_failure(
    descriptor: &BackendDescriptor,
    request: &GenerationRequest,
    failure: &GenerationFailure,
) {
    warn!(
        backend = %descriptor.id,
        prompt_chars = request.prompt.chars().count(),
        max_tokens = request.max_tokens,
        kind = ?failure.kind(),
        error = %failure,
        "generation failed"
    );
}

/// An admitted request. `in_flight` is decremented before the permit goes
/// back to the semaphore, so the count never exceeds the ceiling.
struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl SlotGuard {
    fn new(permit: OwnedSemaphorePermit, in_flight: Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            _permit: permit,
            in_flight,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct CounterGuard(Arc<AtomicUsize>);

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
