//! Producer-facing facade and the background worker.
//!
//! Every producer call returns as soon as its blob is durably queued; the
//! returned [`RequestHandle`] resolves when the drainer delivers or drops
//! it. Network I/O only happens inside [`Pipeline::tick`] and the worker.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use beacon_core::{
    CrashReport, DeviceIdentity, EventRecord, Feature, MetricProvider, RequestObserver, StaticMetrics,
    TimeInstant, TraceRecord, Transport, TEMPORARY_DEVICE_ID,
};
use beacon_store::{MemoryStorage, Storage};
use beacon_transport::HttpTransport;

use crate::backoff::BackoffController;
use crate::config::PipelineConfig;
use crate::consent::ConsentGate;
use crate::crawler::CrawlerFilter;
use crate::drainer::{DrainerSettings, QueueDrainer, TickResult};
use crate::encoder::RequestEncoder;
use crate::error::{PipelineError, Result};
use crate::events::EventQueue;
use crate::health::{HealthCounters, HealthTracker};
use crate::identity::{IdentityManager, TransitionReport};
use crate::outcome::{DropReason, OutcomeRegistry, QueueEvent, RequestHandle};
use crate::queue::RequestQueue;
use crate::sessions::{SessionHandle, SessionRequest, SessionSink, SessionTracker};

pub struct PipelineBuilder {
    config: PipelineConfig,
    storage: Option<Arc<dyn Storage>>,
    transport: Option<Arc<dyn Transport>>,
    metrics: Option<Arc<dyn MetricProvider>>,
    observers: Vec<Arc<dyn RequestObserver>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            storage: None,
            transport: None,
            metrics: None,
            observers: Vec::new(),
        }
    }

    /// Defaults to in-memory storage.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Defaults to an HTTP transport built from the config.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricProvider>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config.validate()?;

        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::new()),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(config.transport_config())
                    .map_err(|e| PipelineError::Config(e.to_string()))?,
            ),
        };
        let metrics: Arc<dyn MetricProvider> = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(StaticMetrics::host()),
        };

        let health = Arc::new(HealthTracker::load(storage.clone()));
        let identity = Arc::new(IdentityManager::load_or_init(
            storage.clone(),
            config.device_id.as_deref(),
            config.start_in_temporary_id_mode,
        )?);
        let consent = ConsentGate::load(
            storage.clone(),
            health.clone(),
            config.consent.required,
            &config.consent.granted,
        )?;
        let encoder = Arc::new(RequestEncoder::new(
            config.app_key.clone(),
            config.sdk_name.clone(),
            config.sdk_version.clone(),
            config.limits.clone(),
            metrics,
            health.clone(),
        ));
        let queue = Arc::new(RequestQueue::new(
            identity.clone(),
            Arc::new(OutcomeRegistry::new()),
            health.clone(),
            config.request_queue_capacity,
        ));
        let events = EventQueue::new(
            storage.clone(),
            encoder.clone(),
            queue.clone(),
            health.clone(),
            config.event_queue_capacity,
            config.flush_threshold(),
        );
        let backoff = Arc::new(BackoffController::new(config.backoff.clone()));
        let cancel = CancellationToken::new();
        let drainer = QueueDrainer::new(
            storage.clone(),
            identity.clone(),
            transport,
            backoff.clone(),
            health.clone(),
            queue.clone(),
            CrawlerFilter::new(&config.crawler),
            DrainerSettings {
                max_request_age: config.max_request_age(),
                age_sweep_interval: config.age_sweep_interval(),
            },
            cancel.clone(),
        );
        for observer in self.observers {
            drainer.add_observer(observer);
        }

        info!(
            device_id = %identity.current().id,
            mode = identity.current().mode.as_str(),
            queued = storage.len().unwrap_or(0),
            "pipeline ready"
        );

        Ok(Pipeline {
            core: Arc::new(Core {
                sessions: SessionTracker::new(health.clone()),
                config,
                storage,
                health,
                identity,
                consent,
                encoder,
                queue,
                events,
                backoff,
                drainer,
                cancel,
                worker: Mutex::new(None),
            }),
        })
    }
}

struct Core {
    config: PipelineConfig,
    storage: Arc<dyn Storage>,
    health: Arc<HealthTracker>,
    identity: Arc<IdentityManager>,
    consent: ConsentGate,
    encoder: Arc<RequestEncoder>,
    queue: Arc<RequestQueue>,
    events: EventQueue,
    sessions: SessionTracker,
    backoff: Arc<BackoffController>,
    drainer: QueueDrainer,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Snapshot for status reporting.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub device_id: String,
    pub device_id_mode: &'static str,
    pub queued_requests: usize,
    pub buffered_events: usize,
    pub pending_outcomes: usize,
    pub consecutive_failures: u32,
    pub leading_session: Option<SessionHandle>,
    pub running_sessions: usize,
    pub held_session_requests: usize,
    pub transitioning: bool,
    pub worker_running: bool,
    pub health: HealthCounters,
}

/// Session requests built by the encoder and appended through the queue.
struct LedgerSink<'a> {
    encoder: &'a RequestEncoder,
    queue: &'a RequestQueue,
    /// Pins the blobs to an identity that is about to be replaced.
    fixed_device_id: Option<&'a str>,
}

impl SessionSink for LedgerSink<'_> {
    fn build(&self, request: SessionRequest) -> Result<beacon_core::RequestBlob> {
        let at = TimeInstant::now();
        let blob = match request {
            SessionRequest::Begin => self.encoder.session_begin_blob(at)?,
            SessionRequest::Update { duration_secs } => self.encoder.session_update_blob(at, duration_secs),
            SessionRequest::End { duration_secs } => self.encoder.session_end_blob(at, duration_secs),
        };
        Ok(match self.fixed_device_id {
            Some(id) => blob.with_fixed_device_id(id),
            None => blob,
        })
    }

    fn emit(&self, blob: beacon_core::RequestBlob) -> Result<RequestHandle> {
        self.queue.enqueue(blob)
    }
}

/// Cheap to clone; all clones drive the same pipeline.
#[derive(Clone)]
pub struct Pipeline {
    core: Arc<Core>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.core.config
    }

    pub fn device_identity(&self) -> DeviceIdentity {
        self.core.identity.current()
    }

    pub fn is_allowed(&self, feature: Feature) -> bool {
        self.core.consent.is_allowed(feature)
    }

    pub fn health(&self) -> HealthCounters {
        self.core.health.snapshot()
    }

    fn enqueue(&self, blob: beacon_core::RequestBlob) -> Result<RequestHandle> {
        self.core.queue.enqueue(blob)
    }

    fn session_sink(&self) -> LedgerSink<'_> {
        LedgerSink {
            encoder: &self.core.encoder,
            queue: &self.core.queue,
            fixed_device_id: None,
        }
    }

    // ── events ──────────────────────────────────────────────────────────

    /// Buffer an event. Reaching the flush threshold batches the buffer
    /// into one request.
    pub fn record_event(&self, event: EventRecord) -> Result<()> {
        if !self.core.consent.is_allowed(Feature::Events) {
            debug!(key = %event.key, "events consent not given, ignoring event");
            return Ok(());
        }
        if self.core.events.record(event)?.flush_due {
            self.flush_events()?;
        }
        Ok(())
    }

    pub fn flush_events(&self) -> Result<Option<RequestHandle>> {
        self.core.events.flush()
    }

    // ── sessions ────────────────────────────────────────────────────────

    pub fn create_session(&self) -> SessionHandle {
        self.core.sessions.create()
    }

    /// `None` when the call was ignored, or when another session leads and
    /// the request is held until this one is promoted.
    pub fn begin_session(&self, session: SessionHandle) -> Result<Option<RequestHandle>> {
        if !self.core.consent.is_allowed(Feature::Sessions) {
            debug!(%session, "sessions consent not given, ignoring begin");
            return Ok(None);
        }
        self.core.sessions.begin(session, Instant::now(), &self.session_sink())
    }

    pub fn update_session(&self, session: SessionHandle) -> Result<Option<RequestHandle>> {
        if !self.core.consent.is_allowed(Feature::Sessions) {
            return Ok(None);
        }
        self.core.sessions.update(session, Instant::now(), &self.session_sink())
    }

    /// Buffered events are flushed first so they precede the end request.
    pub fn end_session(&self, session: SessionHandle) -> Result<Option<RequestHandle>> {
        if !self.core.consent.is_allowed(Feature::Sessions) {
            return Ok(None);
        }
        self.flush_events()?;
        self.core.sessions.end(session, Instant::now(), &self.session_sink())
    }

    fn end_running_sessions(&self) -> Result<()> {
        for session in self.core.sessions.running() {
            self.end_session(session)?;
        }
        Ok(())
    }

    // ── identity ────────────────────────────────────────────────────────

    /// Switch to `new_id`. With `merge` the collector is told to fold the
    /// old identity into the new one; without it, data still queued for the
    /// old identity is discarded.
    pub fn change_device_id(&self, new_id: &str, merge: bool) -> Result<TransitionReport> {
        if new_id.trim().is_empty() {
            return Err(PipelineError::InvalidArgument("device id must not be empty".into()));
        }
        if new_id == TEMPORARY_DEVICE_ID {
            return self.enter_temporary_id_mode();
        }
        let current = self.core.identity.current();
        if current.id == new_id {
            debug!("device id unchanged");
            return Ok(TransitionReport::default());
        }
        if current.is_temporary() {
            return self.settle(self.core.identity.change_without_merge(new_id)?);
        }
        if merge {
            self.flush_events()?;
            let change = self.core.encoder.identity_change_blob(TimeInstant::now());
            self.settle(self.core.identity.change_with_merge(new_id, change)?)
        } else {
            self.change_without_merge(new_id)
        }
    }

    /// Resolve rows the rewrite could not decode.
    fn settle(&self, report: TransitionReport) -> Result<TransitionReport> {
        self.core
            .queue
            .resolve_dropped_ids(report.discarded.clone(), DropReason::Corrupt);
        Ok(report)
    }

    pub fn enter_temporary_id_mode(&self) -> Result<TransitionReport> {
        if self.core.identity.is_temporary() {
            debug!("already in temporary id mode");
            return Ok(TransitionReport::default());
        }
        self.change_without_merge(TEMPORARY_DEVICE_ID)
    }

    /// Running sessions are ended under the old id, the old id's pending
    /// requests are purged, and the sessions begin again under the new id.
    fn change_without_merge(&self, new_id: &str) -> Result<TransitionReport> {
        let core = &self.core;
        let old = core.identity.current();
        self.flush_events()?;

        let ended = core.sessions.end_all(
            Instant::now(),
            &LedgerSink {
                fixed_device_id: Some(&old.id),
                ..self.session_sink()
            },
        )?;

        let report = self.settle(core.identity.change_without_merge(new_id)?)?;
        core.queue
            .resolve_dropped(report.purged.clone(), DropReason::IdentityPurged);

        if core.consent.is_required() {
            let revoke = core.consent.all_revocations();
            let applied = core.consent.apply(&revoke)?;
            if !applied.is_empty() {
                self.enqueue(core.encoder.consent_blob(&applied, TimeInstant::now())?)?;
            }
        }

        if core.consent.is_allowed(Feature::Sessions) {
            for session in ended {
                core.sessions.begin(session, Instant::now(), &self.session_sink())?;
            }
        }
        Ok(report)
    }

    // ── other facts ─────────────────────────────────────────────────────

    pub fn send_crash_report(&self, report: &CrashReport) -> Result<Option<RequestHandle>> {
        if !self.core.consent.is_allowed(Feature::Crashes) {
            debug!("crashes consent not given, ignoring crash report");
            return Ok(None);
        }
        let blob = self.core.encoder.crash_blob(report, TimeInstant::now())?;
        self.enqueue(blob).map(Some)
    }

    pub fn send_trace(&self, trace: &TraceRecord) -> Result<Option<RequestHandle>> {
        if !self.core.consent.is_allowed(Feature::Apm) {
            debug!(name = trace.name(), "apm consent not given, ignoring trace");
            return Ok(None);
        }
        let blob = self.core.encoder.trace_blob(trace, TimeInstant::now())?;
        self.enqueue(blob).map(Some)
    }

    /// Queue a caller-built request. Only needs some consent to be given;
    /// reserved parameters are stripped and the common block is added.
    pub fn add_direct_request(&self, params: &[(String, String)]) -> Result<Option<RequestHandle>> {
        if !self.core.consent.any_given() {
            debug!("no consent given, ignoring direct request");
            return Ok(None);
        }
        match self.core.encoder.direct_blob(params, TimeInstant::now()) {
            Some(blob) => self.enqueue(blob).map(Some),
            None => {
                warn!("direct request had no usable parameters, ignoring it");
                Ok(None)
            }
        }
    }

    // ── ledger maintenance ──────────────────────────────────────────────

    /// Drop every queued request unsent. Returns how many were removed.
    pub fn flush_queues(&self) -> Result<usize> {
        let removed = self.core.storage.remove_matching(&|_| true)?;
        let count = removed.len();
        self.core.queue.resolve_dropped(removed, DropReason::Cleared);
        info!(count, "request queue cleared");
        Ok(count)
    }

    /// Restamp every queued request with the configured app key.
    pub fn overwrite_app_keys(&self) -> Result<usize> {
        let app_key = self.core.config.app_key.as_str();
        let mut rewritten = 0;
        let discarded = self.core.storage.replace_all(
            &mut |blobs| {
                blobs
                    .into_iter()
                    .map(|mut b| {
                        if b.param("app_key") != Some(app_key) {
                            b.set_param("app_key", app_key);
                            rewritten += 1;
                        }
                        b
                    })
                    .collect()
            },
            &[],
        )?;
        self.core.queue.resolve_dropped_ids(discarded, DropReason::Corrupt);
        info!(rewritten, "queued app keys overwritten");
        Ok(rewritten)
    }

    /// Drop queued requests whose app key is not the configured one.
    pub fn erase_wrong_app_key_requests(&self) -> Result<usize> {
        let app_key = self.core.config.app_key.clone();
        let removed = self
            .core
            .storage
            .remove_matching(&|b| b.param("app_key") != Some(app_key.as_str()))?;
        let count = removed.len();
        self.core.queue.resolve_dropped(removed, DropReason::WrongAppKey);
        info!(count, "requests with a foreign app key erased");
        Ok(count)
    }

    /// Grant or revoke features. Revoking `events` flushes the buffer and
    /// revoking `sessions` ends running sessions before the change applies.
    pub fn set_consent(&self, changes: &[(Feature, bool)]) -> Result<Option<RequestHandle>> {
        let core = &self.core;
        if core.consent.is_required() {
            for &(feature, allow) in changes {
                if allow || !core.consent.is_allowed(feature) {
                    continue;
                }
                match feature {
                    Feature::Events => {
                        self.flush_events()?;
                    }
                    Feature::Sessions => self.end_running_sessions()?,
                    _ => {}
                }
            }
        }
        let applied = core.consent.apply(changes)?;
        if applied.is_empty() {
            return Ok(None);
        }
        let blob = core.encoder.consent_blob(&applied, TimeInstant::now())?;
        self.enqueue(blob).map(Some)
    }

    /// Queue a health report. Skipped when disabled or in temporary id mode.
    pub fn send_health_check(&self) -> Result<Option<RequestHandle>> {
        if !self.core.config.health_check_enabled || self.core.identity.is_temporary() {
            return Ok(None);
        }
        let blob = self.core.encoder.health_blob(TimeInstant::now())?;
        self.enqueue(blob).map(Some)
    }

    /// Persist health counters without resetting them.
    pub fn save_state(&self) {
        self.core.health.save_state();
    }

    // ── draining ────────────────────────────────────────────────────────

    /// One drain pass. Safe to call next to the background worker; the
    /// second concurrent pass returns [`TickResult::AlreadyRunning`].
    pub async fn tick(&self) -> Result<TickResult> {
        self.core.drainer.tick().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.core.queue.registry().subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn RequestObserver>) {
        self.core.drainer.add_observer(observer);
    }

    /// Periodic housekeeping: leading-session heartbeat and event flush.
    fn on_timer(&self) -> Result<()> {
        let core = &self.core;
        if core.consent.is_allowed(Feature::Sessions) {
            let beat = core.sessions.heartbeat(
                Instant::now(),
                core.config.session_update_interval(),
                &self.session_sink(),
            )?;
            if let Some((session, duration)) = beat {
                debug!(%session, duration, "session heartbeat");
            }
        }
        if core.events.buffered()? > 0 {
            self.flush_events()?;
        }
        Ok(())
    }

    /// Spawn the background worker. Calling it again while running is a
    /// no-op.
    pub fn start(&self) -> Result<()> {
        if self.core.cancel.is_cancelled() {
            return Err(PipelineError::ShutDown);
        }
        let mut worker = self.core.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        if let Err(e) = self.send_health_check() {
            warn!(error = %e, "failed to queue startup health check");
        }

        let weak: Weak<Core> = Arc::downgrade(&self.core);
        let cancel = self.core.cancel.clone();
        let period = self.core.config.tick_interval();
        info!(interval_ms = period.as_millis() as u64, "starting pipeline worker");

        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(core) = weak.upgrade() else { break };
                        let pipeline = Pipeline { core };
                        if let Err(e) = pipeline.on_timer() {
                            warn!(error = %e, "timer housekeeping failed");
                        }
                        match pipeline.tick().await {
                            Ok(result) => debug!(?result, "drain pass finished"),
                            Err(e) => {
                                error!(error = %e, "drain pass failed");
                                pipeline.core.health.log_error();
                            }
                        }
                    }
                }
            }
            debug!("pipeline worker stopped");
        }));
        Ok(())
    }

    /// Stop the worker. No new send starts after this is called; a send
    /// already in flight finishes and records its outcome first.
    pub async fn shutdown(&self) {
        info!("shutting down pipeline");
        self.core.cancel.cancel();
        let handle = self.core.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "pipeline worker ended abnormally");
            }
        }
        self.core.drainer.wait_idle().await;
        self.core.health.save_state();
    }

    pub fn status(&self) -> Result<PipelineStatus> {
        let core = &self.core;
        let identity = core.identity.current();
        Ok(PipelineStatus {
            device_id: identity.id,
            device_id_mode: identity.mode.as_str(),
            queued_requests: core.storage.len()?,
            buffered_events: core.events.buffered()?,
            pending_outcomes: core.queue.registry().pending_count(),
            consecutive_failures: core.backoff.consecutive_failures(),
            leading_session: core.sessions.leading(),
            running_sessions: core.sessions.running().len(),
            held_session_requests: core.sessions.held_requests(),
            transitioning: core.identity.is_transitioning(),
            worker_running: core.worker.lock().is_some() && !core.cancel.is_cancelled(),
            health: core.health.snapshot(),
        })
    }
}
