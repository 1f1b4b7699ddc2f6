//! Destination connector workers.
//!
//! Each enabled destination runs two tasks for the lifetime of a started
//! channel: an inline worker consuming dispatch jobs from the source
//! dispatcher, and a queue consumer draining the destination's durable queue.
//! The consumer replays recovered items before the worker accepts its first
//! job, so redeliveries always precede new traffic for that destination.

use crate::channel::lifecycle::DestinationBinding;
use crate::config::channel::{DestinationSettings, QueuePolicy};
use crate::connector::{DestinationConnector, DispatchError};
use crate::courier_event;
use crate::health::HealthBoard;
use crate::message::{DestinationOutcome, Message};
use crate::metrics::metrics;
use crate::queue::{DurableQueue, QueueError, QueuedItem};
use crate::resource::{acquire_all, ResourceError, ResourceRegistry};
use crate::transform::{StageContext, TransformOutcome, Transformer};
use humantime::format_duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// One message handed to a destination worker, with a settle channel the
/// worker fires exactly once when the attempt reaches a terminal status.
pub(crate) struct DispatchJob {
    pub(crate) message: Message,
    pub(crate) settle: oneshot::Sender<DestinationOutcome>,
}

pub(crate) struct DestinationWorker {
    channel: String,
    settings: DestinationSettings,
    stage: StageContext,
    transformer: Arc<dyn Transformer>,
    connector: Arc<dyn DestinationConnector>,
    queue: Arc<dyn DurableQueue>,
    resources: Arc<dyn ResourceRegistry>,
    health: Arc<HealthBoard>,
    pending: AtomicU64,
}

impl DestinationWorker {
    pub(crate) fn new(
        channel: impl Into<String>,
        ordinal: usize,
        settings: DestinationSettings,
        binding: &DestinationBinding,
        resources: Arc<dyn ResourceRegistry>,
        health: Arc<HealthBoard>,
    ) -> Self {
        let stage = StageContext::destination(ordinal, settings.name.clone());
        Self {
            channel: channel.into(),
            settings,
            stage,
            transformer: Arc::clone(&binding.transformer),
            connector: Arc::clone(&binding.connector),
            queue: Arc::clone(&binding.queue),
            resources,
            health,
            pending: AtomicU64::new(0),
        }
    }

    /// Inline intake loop. Runs until the job channel closes, the drain token
    /// asks for a final sweep of buffered jobs, or the cancel token fires.
    pub(crate) async fn run_inline(
        self: Arc<Self>,
        mut jobs: mpsc::Receiver<DispatchJob>,
        gate: oneshot::Receiver<()>,
        drain: CancellationToken,
        cancel: CancellationToken,
    ) {
        // Recovered queue items are replayed before any new job is taken.
        let _ = gate.await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => self.handle_job(job).await,
                    None => break,
                },
                _ = drain.cancelled() => {
                    while let Ok(job) = jobs.try_recv() {
                        self.handle_job(job).await;
                    }
                    break;
                }
            }
        }
    }

    async fn handle_job(&self, job: DispatchJob) {
        let DispatchJob { message, settle } = job;
        let outcome = self.process(message).await;
        let _ = settle.send(outcome);
    }

    /// Runs the destination transform, then delivers or queues per the
    /// destination's queue policy.
    async fn process(&self, message: Message) -> DestinationOutcome {
        let name = self.settings.name.clone();

        let transformed = match self.transformer.apply(message, &self.stage).await {
            Ok(TransformOutcome::Transformed(message)) => message,
            Ok(TransformOutcome::Filtered) => {
                metrics().record_destination_filtered(&self.channel, &name);
                courier_event!(
                    debug,
                    "courier::destination",
                    "destination_filtered",
                    channel = self.channel.as_str(),
                    destination = name.as_str()
                );
                return DestinationOutcome::filtered(name);
            }
            Err(err) => {
                // Transform failures never queue; there is no deliverable form
                // of the message to snapshot.
                metrics().record_destination_error(&self.channel, &name, Some("transform"));
                courier_event!(
                    warn,
                    "courier::destination",
                    "destination_error",
                    channel = self.channel.as_str(),
                    destination = name.as_str(),
                    error = err
                );
                return DestinationOutcome::errored(name, 0, err.to_string());
            }
        };

        if self.settings.queue_policy == QueuePolicy::Always {
            return self.enqueue(&transformed, 0, None).await;
        }

        let started = Instant::now();
        match self.attempt_send(&transformed).await {
            Ok(ack) => {
                metrics().record_destination_sent(&self.channel, &name);
                courier_event!(
                    info,
                    "courier::destination",
                    "destination_sent",
                    channel = self.channel.as_str(),
                    destination = name.as_str(),
                    message = transformed.id(),
                    attempt = 1u32,
                    elapsed_ms = started.elapsed().as_millis()
                );
                DestinationOutcome::sent(name, 1, ack)
            }
            Err(err) => {
                let queueable = self.settings.queue_policy == QueuePolicy::OnFailure
                    && err.retryable()
                    && self.settings.retry.allows_attempt(2);
                if queueable {
                    return self.enqueue(&transformed, 1, Some(err.to_string())).await;
                }

                metrics().record_destination_error(&self.channel, &name, Some(failure_reason(&err)));
                courier_event!(
                    warn,
                    "courier::destination",
                    "destination_error",
                    channel = self.channel.as_str(),
                    destination = name.as_str(),
                    message = transformed.id(),
                    attempt = 1u32,
                    error = err
                );
                DestinationOutcome::errored(name, 1, err.to_string())
            }
        }
    }

    /// One dispatch attempt: resource handles held for the duration of the
    /// call, the destination's send timeout applied around it.
    async fn attempt_send(&self, message: &Message) -> Result<String, DispatchError> {
        let _handles = acquire_all(self.resources.as_ref(), &self.settings.resources)
            .await
            .map_err(|err| match err {
                ResourceError::Unknown { .. } => DispatchError::rejected(err.to_string()),
                ResourceError::Closed { .. } => DispatchError::failed(err.to_string()),
            })?;

        match timeout(self.settings.send_timeout, self.connector.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::timeout(self.settings.send_timeout)),
        }
    }

    async fn enqueue(
        &self,
        message: &Message,
        attempts: u32,
        last_error: Option<String>,
    ) -> DestinationOutcome {
        let name = self.settings.name.clone();
        let item = QueuedItem::snapshot(message, name.as_str(), attempts);
        match self.queue.enqueue(item).await {
            Ok(()) => {
                self.add_depth();
                metrics().record_destination_queued(&self.channel, &name);
                courier_event!(
                    info,
                    "courier::destination",
                    "destination_queued",
                    channel = self.channel.as_str(),
                    destination = name.as_str(),
                    message = message.id(),
                    attempts = attempts
                );
                DestinationOutcome::queued(name, attempts, last_error)
            }
            Err(err) => {
                // Fail closed: the message must not be acknowledged as queued
                // when the journal could not record it.
                self.note_queue_fault(&err);
                DestinationOutcome::errored(name, attempts, format!("queue unavailable: {err}"))
            }
        }
    }

    /// Queue consumer loop. Replays recovered items first, opens the worker
    /// gate, then polls the queue until stopped. A durability fault ends the
    /// consumer and leaves the destination degraded.
    pub(crate) async fn run_consumer(
        self: Arc<Self>,
        gate: oneshot::Sender<()>,
        drain: CancellationToken,
        cancel: CancellationToken,
        poll_interval: Duration,
        sequence: Arc<AtomicU64>,
    ) {
        let recovered = match self.queue.recover().await {
            Ok(items) => items,
            Err(err) => {
                self.note_queue_fault(&err);
                let _ = gate.send(());
                return;
            }
        };

        let healthy = self.replay_recovered(recovered, &cancel, &sequence).await;
        let _ = gate.send(());
        if !healthy {
            return;
        }

        self.consume(drain, cancel, poll_interval).await;
    }

    /// One redelivery pass over items that survived a restart, in enqueue
    /// order. The first item that fails retryably keeps its place at the head
    /// and stops the pass so ordering holds.
    async fn replay_recovered(
        &self,
        recovered: Vec<QueuedItem>,
        cancel: &CancellationToken,
        sequence: &AtomicU64,
    ) -> bool {
        self.set_depth(recovered.len() as u64);
        if recovered.is_empty() {
            return true;
        }

        metrics().record_queue_replayed(recovered.len() as u64);
        courier_event!(
            info,
            "courier::destination",
            "queue_replayed",
            channel = self.channel.as_str(),
            destination = self.settings.name.as_str(),
            items = recovered.len()
        );

        // Message identifiers keep rising across restarts.
        for item in &recovered {
            sequence.fetch_max(item.message_id, Ordering::Relaxed);
        }

        for item in recovered {
            if cancel.is_cancelled() {
                break;
            }

            let attempt = item.attempts + 1;
            if !self.settings.retry.allows_attempt(attempt) {
                if !self.dispose(&item, "exhausted", "retry attempts exhausted").await {
                    return false;
                }
                continue;
            }

            let message = item.restore();
            match self.attempt_send(&message).await {
                Ok(_) => {
                    if !self.settle_sent(&item, attempt).await {
                        return false;
                    }
                }
                Err(err) => {
                    let terminal =
                        !err.retryable() || !self.settings.retry.allows_attempt(attempt + 1);
                    if terminal {
                        if !self.dispose(&item, failure_reason(&err), &err.to_string()).await {
                            return false;
                        }
                    } else {
                        courier_event!(
                            warn,
                            "courier::destination",
                            "destination_error",
                            channel = self.channel.as_str(),
                            destination = self.settings.name.as_str(),
                            message = item.message_id,
                            attempt = attempt,
                            will_retry = true,
                            error = err
                        );
                        break;
                    }
                }
            }
        }

        true
    }

    async fn consume(
        &self,
        drain: CancellationToken,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let next = match self.queue.dequeue_next().await {
                Ok(next) => next,
                Err(err) => {
                    self.note_queue_fault(&err);
                    return;
                }
            };

            match next {
                Some(item) => {
                    if !self.deliver_queued(item, &cancel).await {
                        return;
                    }
                }
                None => {
                    // Draining stops the consumer once the queue is empty.
                    if drain.is_cancelled() {
                        return;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = drain.cancelled() => {}
                        _ = sleep(poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Drives one queued item to a terminal disposition, sleeping between
    /// attempts per the destination's retry policy. Returns `false` when the
    /// consumer must exit, leaving the item queued for the next start.
    async fn deliver_queued(&self, item: QueuedItem, cancel: &CancellationToken) -> bool {
        let message = item.restore();
        let mut attempts = item.attempts;

        loop {
            attempts += 1;
            if !self.settings.retry.allows_attempt(attempts) {
                return self.dispose(&item, "exhausted", "retry attempts exhausted").await;
            }

            match self.attempt_send(&message).await {
                Ok(_) => return self.settle_sent(&item, attempts).await,
                Err(err) if !err.retryable() => {
                    return self.dispose(&item, failure_reason(&err), &err.to_string()).await;
                }
                Err(err) => {
                    if !self.settings.retry.allows_attempt(attempts + 1) {
                        return self.dispose(&item, "exhausted", &err.to_string()).await;
                    }

                    let delay = self.settings.retry.delay_before(attempts + 1);
                    courier_event!(
                        warn,
                        "courier::destination",
                        "destination_error",
                        channel = self.channel.as_str(),
                        destination = self.settings.name.as_str(),
                        message = item.message_id,
                        attempt = attempts,
                        will_retry = true,
                        retry_in = format_duration(delay),
                        error = err
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn settle_sent(&self, item: &QueuedItem, attempts: u32) -> bool {
        if let Err(err) = self.queue.acknowledge(item).await {
            self.note_queue_fault(&err);
            return false;
        }
        self.drop_depth();
        metrics().record_destination_sent(&self.channel, &self.settings.name);
        courier_event!(
            info,
            "courier::destination",
            "destination_sent",
            channel = self.channel.as_str(),
            destination = self.settings.name.as_str(),
            message = item.message_id,
            attempt = attempts
        );
        true
    }

    /// Acknowledges an item that will never be delivered and records the
    /// terminal error.
    async fn dispose(&self, item: &QueuedItem, reason: &'static str, detail: &str) -> bool {
        if let Err(err) = self.queue.acknowledge(item).await {
            self.note_queue_fault(&err);
            return false;
        }
        self.drop_depth();
        metrics().record_destination_error(&self.channel, &self.settings.name, Some(reason));
        courier_event!(
            warn,
            "courier::destination",
            "destination_error",
            channel = self.channel.as_str(),
            destination = self.settings.name.as_str(),
            message = item.message_id,
            will_retry = false,
            error = detail
        );
        true
    }

    fn note_queue_fault(&self, err: &QueueError) {
        self.health.mark_degraded(&self.settings.name, err.to_string());
        metrics().record_destination_error(&self.channel, &self.settings.name, Some("queue"));
        courier_event!(
            error,
            "courier::destination",
            "queue_fault",
            channel = self.channel.as_str(),
            destination = self.settings.name.as_str(),
            error = err
        );
    }

    fn set_depth(&self, depth: u64) {
        self.pending.store(depth, Ordering::Relaxed);
        metrics().set_queue_depth(&self.channel, &self.settings.name, depth);
    }

    fn add_depth(&self) {
        let depth = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        metrics().set_queue_depth(&self.channel, &self.settings.name, depth);
    }

    fn drop_depth(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::Relaxed);
        metrics().set_queue_depth(&self.channel, &self.settings.name, previous.saturating_sub(1));
    }
}

fn failure_reason(err: &DispatchError) -> &'static str {
    match err {
        DispatchError::Rejected { .. } => "rejected",
        DispatchError::Failed { .. } => "failed",
        DispatchError::Timeout { .. } => "timeout",
    }
}
