use crate::error::EngineError;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;

// Type aliases to simplify complex types
type Metadata<M> = <<M as InferenceModel>::Request as RequestMetadata>::Metadata;
type EngineResult<M> = Result<
    InferenceResponse<Metadata<M>, <M as InferenceModel>::Response>,
    EngineError<<M as InferenceModel>::Error>,
>;
type ReplyTx<M> = oneshot::Sender<EngineResult<M>>;

/// Trait for models that can be driven by the [`InferenceEngine`].
///
/// The model is moved onto the engine thread and only ever called from there,
/// one request at a time, so `run` takes `&mut self` and needs no locking.
pub trait InferenceModel {
    /// The request type that the model accepts for inference.
    type Request;
    /// The response type that the model returns after inference.
    type Response;
    /// The error type that can be returned during inference.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs inference on the given request and returns a response or error.
    fn run(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error>;
}

/// Trait for extracting lightweight metadata from inference requests.
///
/// The engine keeps the metadata for the response without cloning heavy data
/// like image buffers.
pub trait RequestMetadata {
    /// The lightweight metadata type that represents the request.
    type Metadata: Send + 'static;

    /// Extracts lightweight metadata from the request.
    fn metadata(&self) -> Self::Metadata;
}

/// Represents the current state of the inference engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// The engine is idle and ready to accept new inference requests.
    Idle,
    /// The engine is currently processing an inference request.
    Processing,
}

impl EngineState {
    /// Returns the state as a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Processing => "processing",
        }
    }
}

/// Response returned by the engine, carrying the model output and timing.
#[derive(Debug)]
pub struct InferenceResponse<Metadata, Res> {
    /// Identifier assigned when the request was scheduled.
    pub id: u64,
    /// Timestamp when the inference started.
    pub start_time: Instant,
    /// Total time taken for the inference.
    pub duration: Duration,
    /// Lightweight metadata extracted from the original request.
    pub request_metadata: Metadata,
    /// The actual response from the model.
    pub response: Res,
}

struct EngineRequest<M: InferenceModel>
where
    M::Request: RequestMetadata,
{
    id: u64,
    request: M::Request,
    reply: ReplyTx<M>,
}

/// Runs an [`InferenceModel`] on a dedicated thread and serialises requests.
///
/// Requests are processed in arrival order. A model error is returned to the
/// caller that sent the request and the engine keeps serving.
pub struct InferenceEngine<M: InferenceModel + Send + 'static>
where
    M::Request: Send + RequestMetadata + 'static,
    M::Response: Send + 'static,
{
    state: Arc<Mutex<EngineState>>,
    req_tx: Option<mpsc::Sender<EngineRequest<M>>>,
    inference_handle: Option<JoinHandle<()>>,
    id_counter: AtomicU64,
}

impl<M: InferenceModel + Send + 'static> InferenceEngine<M>
where
    M::Request: Send + RequestMetadata + 'static,
    M::Response: Send + 'static,
{
    /// Creates a new inference engine and moves the model onto its thread.
    pub fn new(mut model: M) -> Self {
        let (req_tx, req_rx) = mpsc::channel::<EngineRequest<M>>();
        let state = Arc::new(Mutex::new(EngineState::Idle));

        let inference_handle = std::thread::spawn({
            let state = state.clone();
            move || {
                while let Ok(req) = req_rx.recv() {
                    log::debug!("Running inference request {}", req.id);

                    let request_metadata = req.request.metadata();

                    set_state(&state, EngineState::Processing);
                    let start_time = Instant::now();

                    // A panicking model fails only the request that triggered it.
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| model.run(req.request)));
                    let result = match outcome {
                        Ok(Ok(response)) => Ok(InferenceResponse {
                            id: req.id,
                            start_time,
                            duration: start_time.elapsed(),
                            request_metadata,
                            response,
                        }),
                        Ok(Err(e)) => Err(EngineError::Model(e)),
                        Err(payload) => Err(EngineError::Panicked(panic_message(payload))),
                    };

                    match &result {
                        Ok(_) => log::debug!("Inference request {} completed", req.id),
                        Err(e @ EngineError::Panicked(_)) => {
                            log::error!("Inference request {} {e}", req.id)
                        }
                        Err(e) => log::warn!("Inference request {} failed: {e}", req.id),
                    }

                    set_state(&state, EngineState::Idle);

                    if req.reply.send(result).is_err() {
                        log::debug!("Caller of request {} went away", req.id);
                    }
                }
                log::debug!("Request channel closed, inference thread exiting");
            }
        });

        Self {
            state,
            req_tx: Some(req_tx),
            inference_handle: Some(inference_handle),
            id_counter: AtomicU64::new(0),
        }
    }

    /// Returns the current state of the inference engine.
    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a request and returns the channel its result will arrive on.
    pub fn schedule_inference(
        &self,
        request: M::Request,
    ) -> Result<oneshot::Receiver<EngineResult<M>>, EngineError<M::Error>> {
        let tx = self.req_tx.as_ref().ok_or(EngineError::Stopped)?;
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        tx.send(EngineRequest { id, request, reply })
            .map_err(|_| EngineError::Stopped)?;
        Ok(rx)
    }

    /// Runs one request through the model and waits for its result.
    pub async fn infer(
        &self,
        request: M::Request,
    ) -> Result<InferenceResponse<Metadata<M>, M::Response>, EngineError<M::Error>> {
        let rx = self.schedule_inference(request)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Blocking counterpart of [`InferenceEngine::infer`] for non-async callers.
    pub fn infer_blocking(
        &self,
        request: M::Request,
    ) -> Result<InferenceResponse<Metadata<M>, M::Response>, EngineError<M::Error>> {
        let rx = self.schedule_inference(request)?;
        rx.blocking_recv().map_err(|_| EngineError::Stopped)?
    }

    /// Stops the engine and joins the inference thread.
    ///
    /// Requests already queued are still processed before the thread exits.
    pub fn stop(&mut self) {
        self.req_tx.take();
        if let Some(handle) = self.inference_handle.take() {
            if handle.join().is_err() {
                log::error!("Inference thread panicked");
            }
        }
    }
}

impl<M: InferenceModel + Send + 'static> Drop for InferenceEngine<M>
where
    M::Request: Send + RequestMetadata + 'static,
    M::Response: Send + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<EngineState>, new: EngineState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = new;
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
