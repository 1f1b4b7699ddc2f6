//! Channel lifecycle and runtime assembly.
//!
//! A [`Channel`] pairs a validated definition with the runtime bindings that
//! supply its connectors, transformers, and queues, and walks the lifecycle
//! `undeployed -> deployed -> started -> stopping -> stopped`. Starting spawns
//! the destination workers, queue consumers, and intake pumps; stopping drains
//! them in producer-to-consumer order so no accepted message is stranded
//! outside a durable queue.

use crate::adapter::InboundAdapter;
use crate::channel::destination::DestinationWorker;
use crate::channel::source::{DestinationPort, SourceDispatcher, SourceParts};
use crate::config::channel::ChannelDefinition;
use crate::connector::DestinationConnector;
use crate::courier_event;
use crate::health::{ChannelHealth, HealthBoard};
use crate::message::Response;
use crate::queue::DurableQueue;
use crate::resource::ResourceRegistry;
use crate::transform::{Postprocessor, Transformer};
use humantime::format_duration;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where a channel sits in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Undeployed,
    Deployed,
    Started,
    Stopping,
    Stopped,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Undeployed => "undeployed",
            ChannelState::Deployed => "deployed",
            ChannelState::Started => "started",
            ChannelState::Stopping => "stopping",
            ChannelState::Stopped => "stopped",
        }
    }

    fn can_transition(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Undeployed, Deployed)
                | (Deployed, Started)
                | (Deployed, Undeployed)
                | (Started, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Started)
                | (Stopped, Deployed)
                | (Stopped, Undeployed)
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("channel cannot move from {from} to {to}")]
    InvalidTransition { from: ChannelState, to: ChannelState },
    #[error("channel is not started")]
    NotStarted,
    #[error("no binding supplied for destination `{destination}`")]
    MissingBinding { destination: String },
    #[error("binding `{destination}` does not match any destination")]
    UnknownBinding { destination: String },
}

/// Runtime counterpart of one configured destination: the transformer,
/// connector, and durable queue that destination runs with.
pub struct DestinationBinding {
    pub(crate) name: String,
    pub(crate) transformer: Arc<dyn Transformer>,
    pub(crate) connector: Arc<dyn DestinationConnector>,
    pub(crate) queue: Arc<dyn DurableQueue>,
}

impl DestinationBinding {
    pub fn new(
        name: impl Into<String>,
        transformer: Arc<dyn Transformer>,
        connector: Arc<dyn DestinationConnector>,
        queue: Arc<dyn DurableQueue>,
    ) -> Self {
        Self {
            name: name.into(),
            transformer,
            connector,
            queue,
        }
    }
}

/// Everything a channel needs beyond its definition: the inbound adapter,
/// source transformer, shared resources, and one binding per destination.
pub struct ChannelBindings {
    pub(crate) adapter: Arc<dyn InboundAdapter>,
    pub(crate) transformer: Arc<dyn Transformer>,
    pub(crate) postprocessor: Option<Arc<dyn Postprocessor>>,
    pub(crate) resources: Arc<dyn ResourceRegistry>,
    pub(crate) destinations: Vec<DestinationBinding>,
    pub(crate) queue_poll_interval: Duration,
}

impl ChannelBindings {
    pub fn new(
        adapter: Arc<dyn InboundAdapter>,
        transformer: Arc<dyn Transformer>,
        resources: Arc<dyn ResourceRegistry>,
    ) -> Self {
        Self {
            adapter,
            transformer,
            postprocessor: None,
            resources,
            destinations: Vec::new(),
            queue_poll_interval: DEFAULT_QUEUE_POLL_INTERVAL,
        }
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.postprocessor = Some(postprocessor);
        self
    }

    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn destination(mut self, binding: DestinationBinding) -> Self {
        self.destinations.push(binding);
        self
    }

    fn binding_for(&self, name: &str) -> Option<&DestinationBinding> {
        self.destinations
            .iter()
            .find(|binding| binding.name == name)
    }
}

/// One deployable message channel. All methods take `&self`; a channel is
/// usually shared behind an `Arc` between the source connector and whatever
/// drives lifecycle changes.
pub struct Channel {
    definition: RwLock<Arc<ChannelDefinition>>,
    bindings: RwLock<Arc<ChannelBindings>>,
    health: Arc<HealthBoard>,
    sequence: Arc<AtomicU64>,
    state: watch::Sender<ChannelState>,
    dispatcher: RwLock<Option<Arc<SourceDispatcher>>>,
    runtime: Mutex<Option<ChannelRuntime>>,
}

impl Channel {
    pub fn new(definition: ChannelDefinition, bindings: ChannelBindings) -> Self {
        let (state, _) = watch::channel(ChannelState::Undeployed);
        Self {
            definition: RwLock::new(Arc::new(definition)),
            bindings: RwLock::new(Arc::new(bindings)),
            health: Arc::new(HealthBoard::new()),
            sequence: Arc::new(AtomicU64::new(0)),
            state,
            dispatcher: RwLock::new(None),
            runtime: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn health(&self) -> ChannelHealth {
        self.health.current()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<ChannelHealth> {
        self.health.subscribe()
    }

    pub fn definition(&self) -> Arc<ChannelDefinition> {
        Arc::clone(&self.definition.read().expect("definition lock poisoned"))
    }

    /// Validates the bindings against the definition and marks the channel
    /// deployable. Clears any degraded marks left by an earlier run.
    pub fn deploy(&self) -> Result<(), LifecycleError> {
        let from = self.state();
        if from != ChannelState::Undeployed {
            return Err(LifecycleError::InvalidTransition {
                from,
                to: ChannelState::Deployed,
            });
        }

        {
            let definition = self.definition.read().expect("definition lock poisoned");
            let bindings = self.bindings.read().expect("bindings lock poisoned");
            validate_bindings(&definition, &bindings)?;
        }

        self.transition(ChannelState::Deployed)?;
        self.health.reset();
        Ok(())
    }

    /// Swaps in a new definition and bindings. Allowed while undeployed or
    /// stopped; a started channel must stop first.
    pub fn redeploy(
        &self,
        definition: ChannelDefinition,
        bindings: ChannelBindings,
    ) -> Result<(), LifecycleError> {
        validate_bindings(&definition, &bindings)?;
        self.transition(ChannelState::Deployed)?;
        *self.definition.write().expect("definition lock poisoned") = Arc::new(definition);
        *self.bindings.write().expect("bindings lock poisoned") = Arc::new(bindings);
        self.health.reset();
        Ok(())
    }

    pub fn undeploy(&self) -> Result<(), LifecycleError> {
        self.transition(ChannelState::Undeployed)
    }

    /// Spawns the channel runtime: one worker and one queue consumer per
    /// enabled destination, plus intake pumps when the source buffers.
    /// Ingestion is accepted as soon as this returns; each destination opens
    /// for new traffic once its recovered queue items have been replayed.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let mut runtime_slot = self.runtime.lock().await;

        let definition = self.definition();
        let bindings = {
            let guard = self.bindings.read().expect("bindings lock poisoned");
            Arc::clone(&guard)
        };

        let mut planned = Vec::new();
        for (ordinal, settings) in definition.destinations.iter().enumerate() {
            if !settings.enabled {
                continue;
            }
            let binding = bindings.binding_for(&settings.name).ok_or_else(|| {
                LifecycleError::MissingBinding {
                    destination: settings.name.clone(),
                }
            })?;
            planned.push((ordinal, settings, binding));
        }

        self.transition(ChannelState::Started)?;

        let tracker = TaskTracker::new();
        let worker_drain = CancellationToken::new();
        let consumer_drain = CancellationToken::new();
        let hard_cancel = CancellationToken::new();

        let destination_count = planned.len();
        let inbox_capacity = definition.source.processing_threads.max(1);
        let mut ports = Vec::with_capacity(destination_count);
        let mut workers = Vec::with_capacity(destination_count);
        let mut consumers = Vec::with_capacity(destination_count);

        for (ordinal, settings, binding) in planned {
            let worker = Arc::new(DestinationWorker::new(
                definition.name.clone(),
                ordinal,
                settings.clone(),
                binding,
                Arc::clone(&bindings.resources),
                Arc::clone(&self.health),
            ));
            let (jobs, inbox) = mpsc::channel(inbox_capacity);
            let (gate_open, gate) = oneshot::channel();

            workers.push(tokio::spawn(Arc::clone(&worker).run_inline(
                inbox,
                gate,
                worker_drain.clone(),
                hard_cancel.clone(),
            )));
            consumers.push(tokio::spawn(worker.run_consumer(
                gate_open,
                consumer_drain.clone(),
                hard_cancel.clone(),
                bindings.queue_poll_interval,
                Arc::clone(&self.sequence),
            )));
            ports.push(DestinationPort {
                name: settings.name.clone(),
                jobs,
            });
        }

        let dispatcher = Arc::new(SourceDispatcher::new(SourceParts {
            channel: definition.name.clone(),
            settings: definition.source.clone(),
            adapter: Arc::clone(&bindings.adapter),
            transformer: Arc::clone(&bindings.transformer),
            postprocessor: bindings.postprocessor.clone(),
            resources: Arc::clone(&bindings.resources),
            ports,
            sequence: Arc::clone(&self.sequence),
            tracker: tracker.clone(),
        }));

        let mut pumps = Vec::new();
        if dispatcher.buffered() {
            let inbox = Arc::new(Mutex::new(dispatcher.open_intake()));
            for _ in 0..dispatcher.settings().processing_threads.max(1) {
                pumps.push(tokio::spawn(
                    Arc::clone(&dispatcher).run_pump(Arc::clone(&inbox), hard_cancel.clone()),
                ));
            }
        }

        *self.dispatcher.write().expect("dispatcher lock poisoned") = Some(dispatcher);
        *runtime_slot = Some(ChannelRuntime {
            tracker,
            worker_drain,
            consumer_drain,
            hard_cancel,
            pumps,
            workers,
            consumers,
        });

        courier_event!(
            info,
            "courier::channel",
            "channel_started",
            channel = definition.name.as_str(),
            destinations = destination_count
        );
        Ok(())
    }

    /// Graceful stop: refuses new ingestion, lets every in-flight message
    /// settle, then drains each destination queue to empty before the workers
    /// and consumers exit. May wait indefinitely on a destination whose
    /// retries never succeed; use [`Channel::halt`] to bound that.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut runtime_slot = self.runtime.lock().await;
        self.transition(ChannelState::Stopping)?;

        let name = self.definition().name.clone();
        courier_event!(
            info,
            "courier::channel",
            "channel_stopping",
            channel = name.as_str()
        );

        let dispatcher = self.dispatcher.write().expect("dispatcher lock poisoned").take();
        if let Some(runtime) = runtime_slot.as_mut() {
            runtime.drain(dispatcher.as_ref()).await;
        }
        *runtime_slot = None;

        self.transition(ChannelState::Stopped)?;
        courier_event!(
            info,
            "courier::channel",
            "channel_stopped",
            channel = name.as_str()
        );
        Ok(())
    }

    /// Stop with a deadline. Drains gracefully for up to `grace`, then cancels
    /// the runtime tasks; the current delivery attempt per destination still
    /// runs to its send timeout. Queued items stay journaled for the next
    /// start. Already-stopped channels return `Ok`.
    pub async fn halt(&self, grace: Duration) -> Result<(), LifecycleError> {
        let mut runtime_slot = self.runtime.lock().await;
        match self.state() {
            ChannelState::Started => self.transition(ChannelState::Stopping)?,
            ChannelState::Stopped => return Ok(()),
            from => {
                return Err(LifecycleError::InvalidTransition {
                    from,
                    to: ChannelState::Stopped,
                })
            }
        }

        let name = self.definition().name.clone();
        courier_event!(
            info,
            "courier::channel",
            "channel_stopping",
            channel = name.as_str(),
            grace = format_duration(grace)
        );

        let dispatcher = self.dispatcher.write().expect("dispatcher lock poisoned").take();
        if let Some(runtime) = runtime_slot.as_mut() {
            if timeout(grace, runtime.drain(dispatcher.as_ref())).await.is_err() {
                runtime.hard_cancel.cancel();
                runtime.drain(dispatcher.as_ref()).await;
            }
        }
        *runtime_slot = None;

        self.transition(ChannelState::Stopped)?;
        courier_event!(
            info,
            "courier::channel",
            "channel_stopped",
            channel = name.as_str()
        );
        Ok(())
    }

    /// Hands one raw payload to the source dispatcher and returns the
    /// response the source connector should relay to its caller.
    pub async fn ingest(&self, payload: impl Into<Vec<u8>>) -> crate::error::Result<Response> {
        let dispatcher = {
            let guard = self.dispatcher.read().expect("dispatcher lock poisoned");
            guard.clone()
        };
        match dispatcher {
            Some(dispatcher) => dispatcher.ingest(payload.into()).await,
            None => Err(LifecycleError::NotStarted.into()),
        }
    }

    fn transition(&self, to: ChannelState) -> Result<(), LifecycleError> {
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            if state.can_transition(to) {
                *state = to;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        match rejected {
            Some(from) => Err(LifecycleError::InvalidTransition { from, to }),
            None => Ok(()),
        }
    }
}

/// Handles for everything a started channel spawned. Drained in dependency
/// order: intake pumps feed the tracker's completion tasks, completion tasks
/// feed the workers, and the consumers go last so queues empty out.
struct ChannelRuntime {
    tracker: TaskTracker,
    worker_drain: CancellationToken,
    consumer_drain: CancellationToken,
    hard_cancel: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    consumers: Vec<JoinHandle<()>>,
}

impl ChannelRuntime {
    /// Runs the shutdown sequence. Safe to call again after a timeout cut the
    /// first attempt short; completed joins are not repeated.
    async fn drain(&mut self, dispatcher: Option<&Arc<SourceDispatcher>>) {
        if let Some(dispatcher) = dispatcher {
            dispatcher.close_intake();
        }
        Self::join_all(&mut self.pumps).await;

        self.tracker.close();
        self.tracker.wait().await;
        if let Some(dispatcher) = dispatcher {
            // An ingest call that was admitted before the tracker closed may
            // still be spawning its completion task; its permit covers it.
            dispatcher.wait_idle().await;
        }

        self.worker_drain.cancel();
        Self::join_all(&mut self.workers).await;

        self.consumer_drain.cancel();
        Self::join_all(&mut self.consumers).await;
    }

    async fn join_all(handles: &mut Vec<JoinHandle<()>>) {
        while let Some(handle) = handles.last_mut() {
            let _ = handle.await;
            handles.pop();
        }
    }
}

impl Drop for ChannelRuntime {
    fn drop(&mut self) {
        self.hard_cancel.cancel();
    }
}

fn validate_bindings(
    definition: &ChannelDefinition,
    bindings: &ChannelBindings,
) -> Result<(), LifecycleError> {
    for settings in &definition.destinations {
        if settings.enabled && bindings.binding_for(&settings.name).is_none() {
            return Err(LifecycleError::MissingBinding {
                destination: settings.name.clone(),
            });
        }
    }
    for binding in &bindings.destinations {
        if !definition
            .destinations
            .iter()
            .any(|settings| settings.name == binding.name)
        {
            return Err(LifecycleError::UnknownBinding {
                destination: binding.name.clone(),
            });
        }
    }
    Ok(())
}
