//! Events tracker
//!
//! Owns the in-memory queue and exposes the public tracking contract:
//! `track_event`, `track_external_event`, `update_user`,
//! `generate_checkout_session_id`, `trace_id`, `flush_all_events` and
//! `dispose`. None of these return errors; failures are logged and counted.
//!
//! Delivery is driven by a [`FlushScheduler`] whose callback is
//! [`TrackerCore`]: each run evicts events that can never fit a request,
//! packs the longest prefix of the queue that fits, posts it, and on
//! acknowledgement removes exactly the sent ids. Events tracked while a
//! request is in flight stay queued behind it.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{fits_alone, Batch, BatchBuilder};
use crate::clock::{Clock, SystemClock};
use crate::config::{LibraryConfig, TrackerConfig};
use crate::context::{build_context, Environment, SystemEnvironment, SDK_SOURCE};
use crate::errors::{EventsError, EventsResult};
use crate::event::{Event, EventData, ExternalEvent, UserIdentity};
use crate::flush::{FlushCallback, FlushOptions, FlushScheduler, SchedulerState};
use crate::metrics::TrackerMetrics;
use crate::sdk_events::SdkEvent;
use crate::store::{KeyValueStore, MemoryStore};
use crate::trace::TraceIdentity;
use crate::transport::{EventsTransport, HttpTransport};

/// Queue plus everything a flush needs
pub struct TrackerCore {
    queue: Mutex<VecDeque<Event>>,
    user: ArcSwap<UserIdentity>,
    transport: Arc<dyn EventsTransport>,
    max_batch_bytes: usize,
    metrics: TrackerMetrics,
}

impl TrackerCore {
    fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        queue.push_back(event);
        self.metrics.events_queued.set(queue.len() as i64);
    }

    /// Evict unsendable events and pack the next request, `None` if nothing
    /// is left to send
    fn next_batch(&self) -> Option<Batch> {
        let mut queue = self.queue.lock();
        let user = self.user.load_full();
        let mut builder = BatchBuilder::new(self.max_batch_bytes);
        let mut evicted = HashSet::new();

        for event in queue.iter() {
            let encoded = match event.encode(&user) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(
                        event_name = event.event_name(),
                        event_id = %event.id(),
                        error = %e,
                        "Failed to serialize event, dropping"
                    );
                    self.metrics.events_dropped.inc();
                    evicted.insert(event.id());
                    continue;
                }
            };

            if !fits_alone(encoded.size(), self.max_batch_bytes) {
                warn!(
                    event_name = %encoded.event_name,
                    size = encoded.size(),
                    max_batch_bytes = self.max_batch_bytes,
                    "Event exceeds the batch size limit, dropping"
                );
                self.metrics.events_oversized.inc();
                evicted.insert(encoded.id);
                continue;
            }

            if builder.try_push(encoded).is_some() {
                break;
            }
        }

        if !evicted.is_empty() {
            queue.retain(|e| !evicted.contains(&e.id()));
            self.metrics.events_queued.set(queue.len() as i64);
        }

        builder.finish()
    }

    fn acknowledge(&self, batch: &Batch) -> bool {
        let sent: HashSet<Uuid> = batch.ids.iter().copied().collect();
        let mut queue = self.queue.lock();
        queue.retain(|e| !sent.contains(&e.id()));

        self.metrics.events_sent.inc_by(batch.len() as u64);
        self.metrics.batches_sent.inc();
        self.metrics.events_queued.set(queue.len() as i64);

        debug!(
            count = batch.len(),
            remaining = queue.len(),
            "Events flushed successfully"
        );
        queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl FlushCallback for TrackerCore {
    async fn flush(&self, options: FlushOptions) -> EventsResult<bool> {
        let Some(batch) = self.next_batch() else {
            return Ok(true);
        };

        debug!(
            count = batch.len(),
            bytes = batch.body.len(),
            teardown = options.teardown,
            "Sending events batch"
        );

        let started = Instant::now();
        let result = self.transport.post_events(batch.body.clone(), options).await;
        self.metrics
            .request_latency
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(200) | Ok(201) => Ok(self.acknowledge(&batch)),
            Ok(status) => {
                self.metrics.flush_failures.inc();
                warn!(
                    status,
                    endpoint = self.transport.endpoint(),
                    count = batch.len(),
                    "Collector rejected events batch"
                );
                Err(EventsError::UnexpectedStatus {
                    endpoint: self.transport.endpoint().to_string(),
                    status,
                })
            }
            Err(e) => {
                self.metrics.flush_failures.inc();
                warn!(error = %e, count = batch.len(), "Failed to send events batch");
                Err(e)
            }
        }
    }
}

/// Explicitly constructed tracker; one per checkout
pub struct EventsTracker {
    core: Arc<TrackerCore>,
    scheduler: FlushScheduler,
    trace: TraceIdentity,
    checkout_session_id: RwLock<Option<String>>,
    environment: Arc<dyn Environment>,
    clock: Arc<dyn Clock>,
    library: LibraryConfig,
    rc_source: Option<String>,
    disposed: AtomicBool,
}

/// Builder for [`EventsTracker`]; unset collaborators fall back to the
/// system implementations and an HTTP transport
pub struct EventsTrackerBuilder {
    config: TrackerConfig,
    user: UserIdentity,
    transport: Option<Arc<dyn EventsTransport>>,
    clock: Option<Arc<dyn Clock>>,
    environment: Option<Arc<dyn Environment>>,
    store: Option<Arc<dyn KeyValueStore>>,
    rc_source: Option<String>,
}

impl EventsTrackerBuilder {
    pub fn transport(mut self, transport: Arc<dyn EventsTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Store for workflow trace ids; overrides `trace.store_path`
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Purchase origin reported as `rc_source` in every context
    pub fn rc_source(mut self, rc_source: impl Into<String>) -> Self {
        self.rc_source = Some(rc_source.into());
        self
    }

    pub fn build(self) -> EventsResult<EventsTracker> {
        self.config
            .validate()
            .map_err(|e| EventsError::Configuration(e.to_string()))?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                &self.config.collector,
                &self.config.library,
            )?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(SystemEnvironment));

        let trace = match &self.config.trace.workflow_identifier {
            Some(workflow) => {
                let store = match self.store {
                    Some(store) => store,
                    None => open_store(self.config.trace.store_path.as_deref()),
                };
                TraceIdentity::for_workflow(workflow.clone(), store, clock.clone())
            }
            None => TraceIdentity::ephemeral(clock.clone()),
        };

        let metrics = TrackerMetrics::new()
            .map_err(|e| EventsError::Configuration(format!("metrics registry: {}", e)))?;

        let core = Arc::new(TrackerCore {
            queue: Mutex::new(VecDeque::new()),
            user: ArcSwap::from_pointee(self.user),
            transport,
            max_batch_bytes: self.config.flush.max_batch_bytes,
            metrics,
        });
        let scheduler = FlushScheduler::new(&self.config.flush, core.clone());

        info!(
            trace_id = %trace.id(),
            workflow = trace.workflow_identifier().unwrap_or("none"),
            "Events tracker created"
        );

        Ok(EventsTracker {
            core,
            scheduler,
            trace,
            checkout_session_id: RwLock::new(None),
            environment,
            clock,
            library: self.config.library,
            rc_source: self.rc_source,
            disposed: AtomicBool::new(false),
        })
    }
}

fn open_store(path: Option<&str>) -> Arc<dyn KeyValueStore> {
    match path {
        #[cfg(feature = "sled-store")]
        Some(path) => match crate::store::SledStore::open(path) {
            Ok(store) => return Arc::new(store),
            Err(e) => warn!(path, error = %e, "Failed to open trace store, using memory"),
        },
        #[cfg(not(feature = "sled-store"))]
        Some(path) => warn!(path, "sled-store feature disabled, using memory trace store"),
        None => {}
    }
    Arc::new(MemoryStore::new())
}

impl EventsTracker {
    pub fn builder(config: TrackerConfig, user: UserIdentity) -> EventsTrackerBuilder {
        EventsTrackerBuilder {
            config,
            user,
            transport: None,
            clock: None,
            environment: None,
            store: None,
            rc_source: None,
        }
    }

    /// Tracker posting to the configured collector over HTTP
    pub fn new(config: TrackerConfig, user: UserIdentity) -> EventsResult<Self> {
        Self::builder(config, user).build()
    }

    /// Queue a known SDK event and try to flush
    pub fn track_event(&self, event: SdkEvent) {
        if self.reject_if_disposed() {
            return;
        }

        match event.into_parts() {
            Ok((name, properties)) => self.enqueue(name, properties, SDK_SOURCE),
            Err(e) => {
                error!(error = %e, "Failed to build SDK event, dropping");
                self.core.metrics.events_dropped.inc();
            }
        }
    }

    /// Queue an application-defined event and try to flush
    pub fn track_external_event(&self, event: ExternalEvent) {
        if self.reject_if_disposed() {
            return;
        }

        if let Err(e) = event.validate() {
            error!(
                event_name = %event.event_name,
                error = %e,
                "Invalid external event, dropping"
            );
            self.core.metrics.events_dropped.inc();
            return;
        }

        let ExternalEvent {
            event_name,
            properties,
            source,
        } = event;
        self.enqueue(event_name, properties, &source);
    }

    fn reject_if_disposed(&self) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            debug!("Tracker disposed, ignoring event");
            self.core.metrics.events_dropped.inc();
            return true;
        }
        false
    }

    fn enqueue(&self, event_name: String, properties: Map<String, Value>, source: &str) {
        let context = build_context(
            self.environment.as_ref(),
            &self.library,
            source,
            self.rc_source.as_deref(),
        );

        let event = Event::new(
            EventData {
                event_name,
                properties,
                context,
                trace_id: self.trace.id().to_string(),
                trace_index: self.trace.next_trace_index(),
                checkout_session_id: self.checkout_session_id.read().clone(),
                workflow_identifier: self.trace.workflow_identifier().map(str::to_string),
            },
            self.clock.now_ms(),
        );

        debug!(
            event_name = event.event_name(),
            event_id = %event.id(),
            "Queueing event"
        );
        self.core.push(event);
        self.core.metrics.events_tracked.inc();
        self.scheduler.try_flush();
    }

    /// Attribute queued and future events to a new user
    pub fn update_user(&self, app_user_id: impl Into<String>, is_anonymous: bool) {
        self.core
            .user
            .store(Arc::new(UserIdentity::new(app_user_id, is_anonymous)));
    }

    /// Start a new checkout session for subsequently tracked events
    pub fn generate_checkout_session_id(&self) -> String {
        let id = Uuid::new_v4().to_string();
        *self.checkout_session_id.write() = Some(id.clone());
        debug!(checkout_session_id = %id, "Generated checkout session id");
        id
    }

    pub fn checkout_session_id(&self) -> Option<String> {
        self.checkout_session_id.read().clone()
    }

    pub fn trace_id(&self) -> String {
        self.trace.trace_id()
    }

    /// Send everything queued, retrying until empty or a flush fails
    pub async fn flush_all_events(&self) {
        if self.is_disposed() {
            debug!("Tracker disposed, not flushing");
            return;
        }
        self.scheduler
            .flush_until_drain(FlushOptions::default())
            .await;
    }

    /// Drain once, then stop for good. Later calls do nothing.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            debug!("Tracker already disposed");
            return;
        }

        debug!(queued = self.core.queue_len(), "Disposing events tracker");
        // Draining a stopped scheduler leaves it stopped
        self.scheduler.stop();
        self.scheduler
            .flush_until_drain(FlushOptions::teardown())
            .await;

        let remaining = self.core.queue_len();
        if remaining > 0 {
            warn!(remaining, "Events tracker disposed with undelivered events");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn queue_len(&self) -> usize {
        self.core.queue_len()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn metrics(&self) -> &TrackerMetrics {
        &self.core.metrics
    }
}

impl Drop for EventsTracker {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

impl std::fmt::Debug for EventsTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsTracker")
            .field("trace", &self.trace)
            .field("queued", &self.core.queue_len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
