//! In-process multi-topic event hub.
//!
//! Every registered handler gets its own bounded queue and its own tokio
//! dispatch task, so a slow consumer only ever delays itself. Publishing
//! never blocks: each event goes onto the consumer's unbounded overflow
//! channel, and a forwarder task moves it into the bounded queue. A full
//! queue back-pressures only that consumer's forwarder, and no event is lost.
//!
//! # Guarantees
//!
//! - Per consumer, per topic: events arrive in publish order
//! - No ordering across consumers or across topics
//! - No replay: a handler only sees events published after it registered
//! - After [`EventHub::close`] nothing is accepted; queued events drain

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    EventEnvelope, EventError, ExperimentEventMsg, ModelEventMsg, PipelineEventMsg,
    PipelineStreamsEventMsg, ServerEventMsg, Topic,
};

/// Default per-consumer queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Largest per-consumer queue capacity; larger requests are clamped.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;

struct Subscriber<P> {
    name: String,
    tx: mpsc::UnboundedSender<EventEnvelope<P>>,
}

/// Registration list and fan-out for a single topic.
struct TopicBus<P> {
    topic: Topic,
    subscribers: RwLock<Vec<Subscriber<P>>>,
}

impl<P> TopicBus<P>
where
    P: Clone + Send + 'static,
{
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    fn register<F>(
        &self,
        closed: &AtomicBool,
        name: &str,
        queue_capacity: usize,
        mut handler: F,
    ) -> Result<JoinHandle<()>, EventError>
    where
        F: FnMut(EventEnvelope<P>) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| EventError::NoRuntime(name.to_string()))?;

        let mut subscribers = self.subscribers.write();
        // Checked under the write lock so a concurrent close either sees this
        // subscriber and drops it, or this registration sees the flag.
        if closed.load(Ordering::Acquire) {
            return Err(EventError::Closed);
        }
        if subscribers.iter().any(|s| s.name == name) {
            return Err(EventError::DuplicateHandler {
                topic: self.topic,
                handler: name.to_string(),
            });
        }

        let (tx, mut overflow) = mpsc::unbounded_channel::<EventEnvelope<P>>();
        let (queue_tx, mut queue) =
            mpsc::channel::<EventEnvelope<P>>(queue_capacity.clamp(1, MAX_QUEUE_CAPACITY));
        let topic = self.topic;
        let handler_name = name.to_string();

        // The forwarder owns the only bounded sender, so the dispatch loop
        // below ends only after the overflow is fully forwarded.
        runtime.spawn(async move {
            while let Some(envelope) = overflow.recv().await {
                if queue_tx.send(envelope).await.is_err() {
                    break;
                }
            }
        });

        let task = runtime.spawn(async move {
            while let Some(envelope) = queue.recv().await {
                handler(envelope);
            }
            debug!(topic = %topic, handler = %handler_name, "Event handler drained");
        });

        subscribers.push(Subscriber {
            name: name.to_string(),
            tx,
        });
        debug!(topic = %self.topic, handler = %name, queue_capacity, "Registered event handler");

        Ok(task)
    }

    fn publish(&self, closed: &AtomicBool, envelope: EventEnvelope<P>) {
        let subscribers = self.subscribers.read();
        if closed.load(Ordering::Acquire) {
            debug!(topic = %self.topic, source = %envelope.source, "Hub closed, ignoring event");
            return;
        }

        for subscriber in subscribers.iter() {
            if subscriber.tx.send(envelope.clone()).is_err() {
                let error = EventError::HandlerStopped {
                    topic: self.topic,
                    handler: subscriber.name.clone(),
                };
                warn!(
                    topic = %self.topic,
                    source = %envelope.source,
                    sequence = envelope.sequence,
                    error = %error,
                    "Dropping event for handler"
                );
            }
        }
    }

    fn close(&self) {
        // Dropping the senders ends each dispatch loop once its queue is empty.
        self.subscribers.write().clear();
    }

    fn handler_names(&self) -> Vec<String> {
        self.subscribers
            .read()
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }
}

/// Multi-topic pub/sub bus shared between the store, the scheduler and
/// status subscribers.
pub struct EventHub {
    closed: AtomicBool,
    sequence: AtomicU64,
    models: TopicBus<ModelEventMsg>,
    servers: TopicBus<ServerEventMsg>,
    pipelines: TopicBus<PipelineEventMsg>,
    pipeline_streams: TopicBus<PipelineStreamsEventMsg>,
    experiments: TopicBus<ExperimentEventMsg>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            sequence: AtomicU64::new(1),
            models: TopicBus::new(Topic::Model),
            servers: TopicBus::new(Topic::Server),
            pipelines: TopicBus::new(Topic::Pipeline),
            pipeline_streams: TopicBus::new(Topic::PipelineStreams),
            experiments: TopicBus::new(Topic::Experiment),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers a Model event handler with its own bounded queue.
    ///
    /// Must be called from within a tokio runtime. Handlers registered after
    /// [`close`](Self::close) are rejected with [`EventError::Closed`].
    pub fn register_model_handler<F>(
        &self,
        name: &str,
        queue_capacity: usize,
        handler: F,
    ) -> Result<(), EventError>
    where
        F: FnMut(EventEnvelope<ModelEventMsg>) + Send + 'static,
    {
        let result = self
            .models
            .register(&self.closed, name, queue_capacity, handler);
        self.track(Topic::Model, name, result)
    }

    pub fn register_server_handler<F>(
        &self,
        name: &str,
        queue_capacity: usize,
        handler: F,
    ) -> Result<(), EventError>
    where
        F: FnMut(EventEnvelope<ServerEventMsg>) + Send + 'static,
    {
        let result = self
            .servers
            .register(&self.closed, name, queue_capacity, handler);
        self.track(Topic::Server, name, result)
    }

    pub fn register_pipeline_handler<F>(
        &self,
        name: &str,
        queue_capacity: usize,
        handler: F,
    ) -> Result<(), EventError>
    where
        F: FnMut(EventEnvelope<PipelineEventMsg>) + Send + 'static,
    {
        let result = self
            .pipelines
            .register(&self.closed, name, queue_capacity, handler);
        self.track(Topic::Pipeline, name, result)
    }

    pub fn register_pipeline_streams_handler<F>(
        &self,
        name: &str,
        queue_capacity: usize,
        handler: F,
    ) -> Result<(), EventError>
    where
        F: FnMut(EventEnvelope<PipelineStreamsEventMsg>) + Send + 'static,
    {
        let result = self
            .pipeline_streams
            .register(&self.closed, name, queue_capacity, handler);
        self.track(Topic::PipelineStreams, name, result)
    }

    pub fn register_experiment_handler<F>(
        &self,
        name: &str,
        queue_capacity: usize,
        handler: F,
    ) -> Result<(), EventError>
    where
        F: FnMut(EventEnvelope<ExperimentEventMsg>) + Send + 'static,
    {
        let result = self
            .experiments
            .register(&self.closed, name, queue_capacity, handler);
        self.track(Topic::Experiment, name, result)
    }

    fn track(
        &self,
        topic: Topic,
        name: &str,
        result: Result<JoinHandle<()>, EventError>,
    ) -> Result<(), EventError> {
        match result {
            Ok(task) => {
                self.tasks.lock().push(task);
                Ok(())
            }
            Err(e) => {
                warn!(topic = %topic, handler = %name, error = %e, "Failed to register event handler");
                Err(e)
            }
        }
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    pub fn publish_model_event(&self, source: &str, event: ModelEventMsg) {
        let envelope = self.envelope(Topic::Model, source, event);
        self.models.publish(&self.closed, envelope);
    }

    pub fn publish_server_event(&self, source: &str, event: ServerEventMsg) {
        let envelope = self.envelope(Topic::Server, source, event);
        self.servers.publish(&self.closed, envelope);
    }

    pub fn publish_pipeline_event(&self, source: &str, event: PipelineEventMsg) {
        let envelope = self.envelope(Topic::Pipeline, source, event);
        self.pipelines.publish(&self.closed, envelope);
    }

    pub fn publish_pipeline_streams_event(&self, source: &str, event: PipelineStreamsEventMsg) {
        let envelope = self.envelope(Topic::PipelineStreams, source, event);
        self.pipeline_streams.publish(&self.closed, envelope);
    }

    pub fn publish_experiment_event(&self, source: &str, event: ExperimentEventMsg) {
        let envelope = self.envelope(Topic::Experiment, source, event);
        self.experiments.publish(&self.closed, envelope);
    }

    fn envelope<P>(&self, topic: Topic, source: &str, payload: P) -> EventEnvelope<P> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        EventEnvelope::new(sequence, topic, source, payload)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Names of the handlers currently registered on a topic.
    pub fn handler_names(&self, topic: Topic) -> Vec<String> {
        match topic {
            Topic::Model => self.models.handler_names(),
            Topic::Server => self.servers.handler_names(),
            Topic::Pipeline => self.pipelines.handler_names(),
            Topic::PipelineStreams => self.pipeline_streams.handler_names(),
            Topic::Experiment => self.experiments.handler_names(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting events and lets every dispatch loop drain and exit.
    ///
    /// Calling this more than once is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Event hub already closed");
            return;
        }

        self.models.close();
        self.servers.close();
        self.pipelines.close();
        self.pipeline_streams.close();
        self.experiments.close();
        info!("Event hub closed");
    }

    /// Waits until every dispatch task has finished.
    ///
    /// Only returns once the hub is closed and all queues are drained. A
    /// handler that panicked is reported and otherwise ignored.
    pub async fn wait_for_handlers(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Event handler task ended abnormally");
            }
        }
    }
}
