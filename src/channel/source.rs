//! Source-side dispatch.
//!
//! The dispatcher owns the inbound half of a started channel: it admits
//! payloads under the processing-thread budget, runs batch splitting and the
//! source transformer, fans the message out to every destination worker, and
//! shapes the response the source connector hands back to its caller.
//!
//! Two intake modes exist. Without a buffer, `ingest` drives the message
//! itself and the respond-from mode decides whether it waits for destinations.
//! With a buffer, `ingest` only parks the payload on a bounded channel and a
//! fixed set of pump tasks carries each payload to completion.

use crate::adapter::InboundAdapter;
use crate::backpressure::{BackpressureController, BackpressurePermit};
use crate::channel::destination::DispatchJob;
use crate::channel::lifecycle::LifecycleError;
use crate::channel::response::compose;
use crate::config::channel::{RespondFrom, SourceSettings};
use crate::courier_event;
use crate::message::{
    reduce_statuses, BatchInfo, DestinationOutcome, Message, Response, Status,
    POSTPROCESSOR_BINDING,
};
use crate::metrics::metrics;
use crate::resource::{acquire_all, ResourceRegistry};
use crate::transform::{Postprocessor, StageContext, TransformOutcome, Transformer};
use humantime::format_duration;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Send side of one destination worker's job inbox. Ports are kept in
/// destination ordinal order.
pub(crate) struct DestinationPort {
    pub(crate) name: String,
    pub(crate) jobs: mpsc::Sender<DispatchJob>,
}

pub(crate) struct SourceParts {
    pub(crate) channel: String,
    pub(crate) settings: SourceSettings,
    pub(crate) adapter: Arc<dyn InboundAdapter>,
    pub(crate) transformer: Arc<dyn Transformer>,
    pub(crate) postprocessor: Option<Arc<dyn Postprocessor>>,
    pub(crate) resources: Arc<dyn ResourceRegistry>,
    pub(crate) ports: Vec<DestinationPort>,
    pub(crate) sequence: Arc<AtomicU64>,
    pub(crate) tracker: TaskTracker,
}

pub(crate) struct SourceDispatcher {
    channel: String,
    settings: SourceSettings,
    adapter: Arc<dyn InboundAdapter>,
    transformer: Arc<dyn Transformer>,
    postprocessor: Option<Arc<dyn Postprocessor>>,
    resources: Arc<dyn ResourceRegistry>,
    ports: Vec<DestinationPort>,
    permits: BackpressureController,
    sequence: Arc<AtomicU64>,
    tracker: TaskTracker,
    intake: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
}

/// What the source stage left behind for one message.
enum SourceStage {
    Ready(Message),
    Filtered,
    Failed(String),
}

impl SourceDispatcher {
    pub(crate) fn new(parts: SourceParts) -> Self {
        let permits = BackpressureController::new(parts.settings.processing_threads);
        Self {
            channel: parts.channel,
            settings: parts.settings,
            adapter: parts.adapter,
            transformer: parts.transformer,
            postprocessor: parts.postprocessor,
            resources: parts.resources,
            ports: parts.ports,
            permits,
            sequence: parts.sequence,
            tracker: parts.tracker,
            intake: RwLock::new(None),
        }
    }

    pub(crate) fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    pub(crate) fn buffered(&self) -> bool {
        self.settings.queue_buffer_size > 0
    }

    /// Creates the intake buffer and hands back its receive side for the pump
    /// tasks. Only called on buffered channels, once per start.
    pub(crate) fn open_intake(&self) -> mpsc::Receiver<Vec<u8>> {
        let (intake, inbox) = mpsc::channel(self.settings.queue_buffer_size.max(1));
        *self.intake.write().expect("intake lock poisoned") = Some(intake);
        inbox
    }

    /// Drops the intake sender so pumps see end-of-stream once the buffer is
    /// empty. Later `ingest` calls are refused.
    pub(crate) fn close_intake(&self) {
        self.intake.write().expect("intake lock poisoned").take();
    }

    /// Resolves once every unbuffered in-flight message has released its
    /// admission permit.
    pub(crate) async fn wait_idle(&self) {
        self.permits.wait_idle().await;
    }

    /// Entry point for the source connector. Buffered channels answer as soon
    /// as the payload is parked; unbuffered channels process it here.
    pub(crate) async fn ingest(self: &Arc<Self>, payload: Vec<u8>) -> crate::error::Result<Response> {
        let intake = {
            let guard = self.intake.read().expect("intake lock poisoned");
            guard.clone()
        };
        if let Some(intake) = intake {
            if intake.send(payload).await.is_err() {
                return Err(LifecycleError::NotStarted.into());
            }
            return Ok(self.early_response());
        }

        let permit = Arc::new(self.permits.acquire().await);
        Ok(self.process_payload(payload, permit).await)
    }

    /// Pump loop for buffered intake. Pumps share one receiver and each
    /// carries its payload to completion before taking the next, so the pump
    /// count bounds in-flight work. Exits when the intake closes and the
    /// buffer runs dry, or the cancel token fires.
    pub(crate) async fn run_pump(
        self: Arc<Self>,
        inbox: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let payload = {
                let mut guard = inbox.lock().await;
                tokio::select! {
                    payload = guard.recv() => payload,
                    _ = cancel.cancelled() => return,
                }
            };
            match payload {
                Some(payload) => self.process_buffered(payload).await,
                None => return,
            }
        }
    }

    /// Processes one buffered payload end to end. The caller was already
    /// answered when the payload entered the buffer.
    async fn process_buffered(self: &Arc<Self>, payload: Vec<u8>) {
        let messages = match self.expand_payload(payload).await {
            Ok(messages) => messages,
            Err(_) => return,
        };
        for message in messages {
            if let SourceStage::Ready(message) = self.run_source_stage(message).await {
                let _ = self.finish_message(message).await;
            }
        }
    }

    async fn process_payload(
        self: &Arc<Self>,
        payload: Vec<u8>,
        permit: Arc<BackpressurePermit>,
    ) -> Response {
        let messages = match self.expand_payload(payload).await {
            Ok(messages) => messages,
            Err(response) => return response,
        };

        let mut responses = Vec::with_capacity(messages.len());
        for message in messages {
            responses.push(self.process_message(message, permit.clone()).await);
        }
        self.select_response(responses)
    }

    /// Expands one inbound payload into the messages it carries. A batch
    /// split failure yields the error response handed straight back.
    async fn expand_payload(&self, payload: Vec<u8>) -> Result<Vec<Message>, Response> {
        if !self.settings.process_batch {
            return Ok(vec![Message::new(
                self.channel.clone(),
                self.next_id(),
                payload,
            )]);
        }

        let parts = match self.adapter.split(&payload).await {
            Ok(parts) => parts,
            Err(err) => {
                metrics().inc_source_errors();
                courier_event!(
                    warn,
                    "courier::source",
                    "source_error",
                    channel = self.channel.as_str(),
                    error = err
                );
                return Err(Response::error(err.to_string()));
            }
        };
        if parts.is_empty() {
            metrics().inc_source_errors();
            courier_event!(
                warn,
                "courier::source",
                "source_error",
                channel = self.channel.as_str(),
                error = "batch split produced no messages"
            );
            return Err(Response::error("batch split produced no messages"));
        }

        metrics().inc_batches_split();
        let batch_id = Uuid::new_v4();
        let total = parts.len() as u32;
        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(index, part)| {
                Message::new(self.channel.clone(), self.next_id(), part)
                    .with_batch(BatchInfo::new(batch_id, (index + 1) as u32, total))
            })
            .collect())
    }

    /// Which sub-response answers for a batch. Single messages pass through
    /// unchanged.
    fn select_response(&self, mut responses: Vec<Response>) -> Response {
        let selected = if self.settings.first_response {
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        } else {
            responses.pop()
        };
        selected.unwrap_or_else(|| self.adapter.auto_response(Status::Received))
    }

    async fn process_message(
        self: &Arc<Self>,
        message: Message,
        permit: Arc<BackpressurePermit>,
    ) -> Response {
        let id = message.id();
        let stage = self.run_source_stage(message).await;

        if !self.settings.respond_after_processing {
            // The caller gets its fixed early answer either way; only a
            // message that survived the source stage reaches destinations.
            if let SourceStage::Ready(message) = stage {
                let _ = self.spawn_completion(message, permit);
            }
            return self.early_response();
        }

        match stage {
            SourceStage::Ready(message) => {
                let pending = self.spawn_completion(message, permit);
                match timeout(self.settings.response_timeout, pending).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(_)) => Response::error("processing task cancelled"),
                    Err(_) => {
                        metrics().inc_responses_timed_out();
                        courier_event!(
                            warn,
                            "courier::source",
                            "response_timeout",
                            channel = self.channel.as_str(),
                            message = id,
                            timeout = format_duration(self.settings.response_timeout)
                        );
                        Response::error(format!(
                            "response not ready within {}",
                            format_duration(self.settings.response_timeout)
                        ))
                    }
                }
            }
            SourceStage::Filtered => self.source_stage_response(Status::Filtered, None),
            SourceStage::Failed(detail) => {
                self.source_stage_response(Status::Error, Some(detail))
            }
        }
    }

    /// Receipt accounting plus the source transformer, with source resources
    /// held across the transform.
    async fn run_source_stage(&self, message: Message) -> SourceStage {
        metrics().inc_messages_received();
        courier_event!(
            debug,
            "courier::source",
            "message_received",
            channel = self.channel.as_str(),
            message = message.id(),
            bytes = message.content().len()
        );

        let handles = match acquire_all(self.resources.as_ref(), &self.settings.resources).await {
            Ok(handles) => handles,
            Err(err) => {
                metrics().inc_source_errors();
                courier_event!(
                    warn,
                    "courier::source",
                    "source_error",
                    channel = self.channel.as_str(),
                    message = message.id(),
                    error = err
                );
                return SourceStage::Failed(err.to_string());
            }
        };

        let id = message.id();
        let outcome = self.transformer.apply(message, &StageContext::Source).await;
        drop(handles);

        match outcome {
            Ok(TransformOutcome::Transformed(message)) => SourceStage::Ready(message),
            Ok(TransformOutcome::Filtered) => {
                metrics().inc_source_filtered();
                courier_event!(
                    debug,
                    "courier::source",
                    "source_filtered",
                    channel = self.channel.as_str(),
                    message = id
                );
                SourceStage::Filtered
            }
            Err(err) => {
                metrics().inc_source_errors();
                courier_event!(
                    warn,
                    "courier::source",
                    "source_transform_error",
                    channel = self.channel.as_str(),
                    message = id,
                    error = err
                );
                SourceStage::Failed(err.to_string())
            }
        }
    }

    /// Hands the message to a tracked completion task and returns the channel
    /// its response arrives on. The permit rides along so admission stays
    /// claimed until the message fully settles, even after a response
    /// timeout abandons the wait.
    fn spawn_completion(
        self: &Arc<Self>,
        message: Message,
        permit: Arc<BackpressurePermit>,
    ) -> oneshot::Receiver<Response> {
        let (done, pending) = oneshot::channel();
        let dispatcher = Arc::clone(self);
        self.tracker.spawn(async move {
            let _permit = permit;
            let response = dispatcher.finish_message(message).await;
            let _ = done.send(response);
        });
        pending
    }

    /// Fan-out and settlement: every destination gets the message, outcomes
    /// are collected in ordinal order, the postprocessor runs, and the
    /// respond-from mode shapes the final response.
    async fn finish_message(&self, mut message: Message) -> Response {
        let mut waits = Vec::with_capacity(self.ports.len());
        for port in &self.ports {
            let (settle, settled) = oneshot::channel();
            let job = DispatchJob {
                message: message.clone(),
                settle,
            };
            if port.jobs.send(job).await.is_err() {
                message.record_outcome(DestinationOutcome::errored(
                    port.name.clone(),
                    0,
                    "destination worker unavailable".to_string(),
                ));
                continue;
            }
            waits.push((port.name.clone(), settled));
        }

        for (name, settled) in waits {
            let outcome = match settled.await {
                Ok(outcome) => outcome,
                Err(_) => DestinationOutcome::errored(
                    name,
                    0,
                    "destination worker unavailable".to_string(),
                ),
            };
            message.record_outcome(outcome);
        }

        if let Some(postprocessor) = &self.postprocessor {
            if let Err(err) = postprocessor.process(&mut message).await {
                courier_event!(
                    warn,
                    "courier::source",
                    "postprocessor_error",
                    channel = self.channel.as_str(),
                    message = message.id(),
                    error = err
                );
            }
        }

        self.mode_response(&message)
    }

    fn mode_response(&self, message: &Message) -> Response {
        let ordered: Vec<DestinationOutcome> = self
            .ports
            .iter()
            .filter_map(|port| message.outcomes().get(&port.name).cloned())
            .collect();
        let overall =
            reduce_statuses(ordered.iter().map(|outcome| outcome.status)).unwrap_or(Status::Sent);

        match &self.settings.respond_from {
            RespondFrom::None => Response::none(overall),
            RespondFrom::AutoBefore => self.adapter.auto_response(Status::Received),
            RespondFrom::SourceTransformed => self.adapter.auto_response(Status::Transformed),
            RespondFrom::DestinationsCompleted => {
                compose(&ordered).unwrap_or_else(|| self.adapter.auto_response(overall))
            }
            RespondFrom::Postprocessor => {
                self.binding_response(message, POSTPROCESSOR_BINDING, overall)
            }
            RespondFrom::Binding(name) => self.binding_response(message, name, overall),
        }
    }

    /// Response for a message that never reached destinations. The auto modes
    /// still answer with their fixed status; error detail is attached when
    /// the source stage failed.
    fn source_stage_response(&self, status: Status, detail: Option<String>) -> Response {
        let mut response = match &self.settings.respond_from {
            RespondFrom::None => Response::none(status),
            RespondFrom::AutoBefore => self.adapter.auto_response(Status::Received),
            _ => self.adapter.auto_response(status),
        };
        if detail.is_some() {
            response.error = detail;
        }
        response
    }

    /// The fixed answer handed back before processing when the channel does
    /// not wait for destinations.
    fn early_response(&self) -> Response {
        match &self.settings.respond_from {
            RespondFrom::AutoBefore => self.adapter.auto_response(Status::Received),
            _ => Response::none(Status::Received),
        }
    }

    fn binding_response(&self, message: &Message, key: &str, overall: Status) -> Response {
        match message.binding(key) {
            Some(Value::String(text)) => Response::of(overall, text.clone()),
            Some(value) => Response::of(overall, value.to_string()),
            None => Response::none(overall),
        }
    }

    fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}
