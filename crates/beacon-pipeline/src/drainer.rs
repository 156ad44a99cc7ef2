//! Single consumer of the request ledger.
//!
//! One drain pass at a time: a concurrent `tick` observes the held drain
//! lock and returns immediately. The ledger is only touched between sends;
//! no storage or identity lock is held while the transport is awaited.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use beacon_core::{RequestBlob, RequestKind, RequestObserver, Transport};
use beacon_store::Storage;

use crate::backoff::{BackoffCheck, BackoffController};
use crate::crawler::CrawlerFilter;
use crate::error::Result;
use crate::health::HealthTracker;
use crate::identity::IdentityManager;
use crate::outcome::{DropReason, OutcomeRegistry, RequestOutcome};
use crate::queue::RequestQueue;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickResult {
    /// Ledger is empty; `sent` requests were delivered on the way.
    Finished { sent: usize },
    /// A send failed and draining stopped for this pass.
    SendFailed { sent: usize },
    /// Backoff has not elapsed; nothing was sent.
    BackedOff { remaining: Duration },
    /// Only requests that cannot go out yet remain.
    Stalled { sent: usize },
    /// Another pass is running.
    AlreadyRunning,
    ShutDown,
}

enum SendStep {
    Delivered,
    /// Removed without delivery; draining continues.
    Discarded,
    Failed,
}

pub struct DrainerSettings {
    pub max_request_age: Option<Duration>,
    pub age_sweep_interval: Duration,
}

pub struct QueueDrainer {
    storage: Arc<dyn Storage>,
    identity: Arc<IdentityManager>,
    transport: Arc<dyn Transport>,
    backoff: Arc<BackoffController>,
    health: Arc<HealthTracker>,
    queue: Arc<RequestQueue>,
    crawler: CrawlerFilter,
    observers: RwLock<Vec<Arc<dyn RequestObserver>>>,
    settings: DrainerSettings,
    drain_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl QueueDrainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        identity: Arc<IdentityManager>,
        transport: Arc<dyn Transport>,
        backoff: Arc<BackoffController>,
        health: Arc<HealthTracker>,
        queue: Arc<RequestQueue>,
        crawler: CrawlerFilter,
        settings: DrainerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            storage,
            identity,
            transport,
            backoff,
            health,
            queue,
            crawler,
            observers: RwLock::new(Vec::new()),
            settings,
            drain_lock: Mutex::new(()),
            cancel,
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn RequestObserver>) {
        self.observers.write().push(observer);
    }

    fn registry(&self) -> &OutcomeRegistry {
        self.queue.registry()
    }

    pub async fn tick(&self) -> Result<TickResult> {
        if self.cancel.is_cancelled() {
            return Ok(TickResult::ShutDown);
        }
        let Ok(_pass) = self.drain_lock.try_lock() else {
            debug!("drain pass already running");
            return Ok(TickResult::AlreadyRunning);
        };
        self.drain().await
    }

    /// Resolves once no drain pass is running. Used by shutdown to let an
    /// in-flight send finish updating the ledger.
    pub async fn wait_idle(&self) {
        let _pass = self.drain_lock.lock().await;
    }

    #[instrument(skip(self), fields(transport = self.transport.name()))]
    async fn drain(&self) -> Result<TickResult> {
        if self.crawler.is_crawler() {
            let dropped = self.storage.remove_matching(&|_| true)?;
            if !dropped.is_empty() {
                info!(count = dropped.len(), "crawler device, discarding queued requests");
            }
            self.queue.resolve_dropped(dropped, DropReason::Crawler);
        }

        let mut sent = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(TickResult::ShutDown);
            }
            let now = Instant::now();
            self.sweep_too_old(now)?;

            if self.storage.is_empty()? {
                debug!(sent, "request queue drained");
                self.registry().queue_finished();
                return Ok(TickResult::Finished { sent });
            }

            if let BackoffCheck::Wait { remaining, skipped } = self.backoff.check(now) {
                debug!(remaining_ms = remaining.as_millis() as u64, skipped, "in backoff, skipping send");
                self.health.log_backoff_request();
                self.health.log_consecutive_backoff_request(skipped);
                return Ok(TickResult::BackedOff { remaining });
            }

            let Some(blob) = self.next_sendable()? else {
                debug!(sent, "no sendable request right now");
                return Ok(TickResult::Stalled { sent });
            };

            if self.is_too_old(&blob) {
                self.storage.remove(&blob.id)?;
                self.queue.resolve_dropped(vec![blob], DropReason::TooOld);
                continue;
            }

            match self.send(blob).await? {
                SendStep::Delivered => sent += 1,
                SendStep::Discarded => {}
                SendStep::Failed => return Ok(TickResult::SendFailed { sent }),
            }
        }
    }

    /// Prefers anything over a pending health report.
    fn next_sendable(&self) -> Result<Option<RequestBlob>> {
        let first = self
            .identity
            .peek_sendable(&|b| b.kind != RequestKind::Health)?;
        self.queue.resolve_dropped_ids(first.discarded, DropReason::Corrupt);
        if first.entry.is_some() {
            return Ok(first.entry);
        }
        let second = self.identity.peek_sendable(&|_| true)?;
        self.queue.resolve_dropped_ids(second.discarded, DropReason::Corrupt);
        Ok(second.entry)
    }

    fn sweep_too_old(&self, now: Instant) -> Result<()> {
        let Some(max_age) = self.settings.max_request_age else {
            return Ok(());
        };
        if !self.backoff.claim_age_sweep(now, self.settings.age_sweep_interval) {
            return Ok(());
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let limit = max_age.as_millis() as i64;
        let expired = self.storage.remove_matching(&|b| b.age_ms(now_ms) > limit)?;
        self.queue.resolve_dropped(expired, DropReason::TooOld);
        Ok(())
    }

    fn is_too_old(&self, blob: &RequestBlob) -> bool {
        match self.settings.max_request_age {
            Some(max_age) => blob.age_ms(chrono::Utc::now().timestamp_millis()) > max_age.as_millis() as i64,
            None => false,
        }
    }

    /// One exchange.
    async fn send(&self, blob: RequestBlob) -> Result<SendStep> {
        let remaining = self.storage.len()?.saturating_sub(1);
        let request = blob.to_outgoing(remaining);
        let observers = self.observers.read().clone();
        if !observers.is_empty() {
            let serialized = request.to_query_string();
            for o in &observers {
                o.on_request(&serialized);
            }
        }

        debug!(request_id = %blob.id, kind = %blob.kind, remaining, "sending request");
        let result = self.transport.send(&request).await;

        match result {
            Ok(response) => {
                for o in &observers {
                    o.on_response(Some(response.status), response.body.as_ref(), None);
                }
                self.storage.remove(&blob.id)?;
                self.backoff.record_success();
                if blob.kind == RequestKind::Health {
                    self.health.clear_and_save();
                }
                self.registry().resolve(&blob.id, RequestOutcome::Delivered);
                debug!(request_id = %blob.id, status = response.status, "request delivered");
                Ok(SendStep::Delivered)
            }
            Err(e) => {
                let message = e.to_string();
                for o in &observers {
                    o.on_response(e.status_code(), None, Some(&message));
                }
                if blob.kind == RequestKind::Health {
                    warn!(request_id = %blob.id, error = %e, "health report not delivered, not retrying");
                    self.storage.remove(&blob.id)?;
                    self.registry().resolve(
                        &blob.id,
                        RequestOutcome::Dropped { reason: DropReason::HealthNotRetried },
                    );
                    return Ok(SendStep::Discarded);
                }
                let delay = self.backoff.record_failure(Instant::now(), e.suggested_delay());
                self.health.log_failed_network_request(e.status_code(), &e.detail());
                warn!(
                    request_id = %blob.id,
                    kind = %blob.kind,
                    error_kind = e.error_kind(),
                    status = ?e.status_code(),
                    retry_in_ms = delay.as_millis() as u64,
                    "request failed, keeping it queued"
                );
                self.registry().resolve(&blob.id, RequestOutcome::Failed { error: message });
                Ok(SendStep::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::TEMPORARY_DEVICE_ID;
    use beacon_store::{MemoryStorage, RequestLedger};
    use beacon_transport::{MockReply, MockTransport};

    use crate::config::{BackoffConfig, CrawlerConfig};

    struct Rig {
        storage: Arc<MemoryStorage>,
        transport: Arc<MockTransport>,
        queue: Arc<RequestQueue>,
        health: Arc<HealthTracker>,
        identity: Arc<IdentityManager>,
        drainer: QueueDrainer,
    }

    fn rig_with(transport: MockTransport, crawler: CrawlerConfig, max_age: Option<Duration>) -> Rig {
        let storage = Arc::new(MemoryStorage::new());
        let dyn_storage: Arc<dyn Storage> = storage.clone();
        let health = Arc::new(HealthTracker::load(dyn_storage.clone()));
        let identity =
            Arc::new(IdentityManager::load_or_init(dyn_storage.clone(), Some("dev"), false).unwrap());
        let queue = Arc::new(RequestQueue::new(
            identity.clone(),
            Arc::new(OutcomeRegistry::new()),
            health.clone(),
            100,
        ));
        let transport = Arc::new(transport);
        let drainer = QueueDrainer::new(
            dyn_storage,
            identity.clone(),
            transport.clone(),
            Arc::new(BackoffController::new(BackoffConfig::default())),
            health.clone(),
            queue.clone(),
            CrawlerFilter::new(&crawler),
            DrainerSettings {
                max_request_age: max_age,
                age_sweep_interval: Duration::from_secs(60),
            },
            CancellationToken::new(),
        );
        Rig { storage, transport, queue, health, identity, drainer }
    }

    fn rig(transport: MockTransport) -> Rig {
        rig_with(transport, CrawlerConfig::default(), None)
    }

    fn session() -> RequestBlob {
        RequestBlob::new(RequestKind::Session, vec![("begin_session".into(), "1".into())])
    }

    #[tokio::test]
    async fn empty_tick_notifies_once() {
        let r = rig(MockTransport::accepting());
        let mut rx = r.queue.registry().subscribe();
        assert_eq!(r.drainer.tick().await.unwrap(), TickResult::Finished { sent: 0 });
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(r.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn drains_everything_in_order() {
        let r = rig(MockTransport::accepting());
        let a = r.queue.enqueue(session()).unwrap();
        r.queue.enqueue(RequestBlob::new(RequestKind::Events, Vec::new())).unwrap();
        assert_eq!(r.drainer.tick().await.unwrap(), TickResult::Finished { sent: 2 });
        assert_eq!(a.outcome().await, Some(RequestOutcome::Delivered));
        assert_eq!(r.transport.sent_param("rr"), vec![Some("1".into()), Some("0".into())]);
        assert_eq!(r.transport.sent_param("device_id"), vec![Some("dev".into()), Some("dev".into())]);
        assert!(r.storage.is_empty().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_blob_and_backs_off() {
        let r = rig(MockTransport::new(vec![MockReply::status(500)]));
        let handle = r.queue.enqueue(session()).unwrap();
        assert_eq!(r.drainer.tick().await.unwrap(), TickResult::SendFailed { sent: 0 });
        assert!(matches!(handle.outcome().await, Some(RequestOutcome::Failed { .. })));
        assert_eq!(r.storage.len().unwrap(), 1);
        assert!(matches!(r.drainer.tick().await.unwrap(), TickResult::BackedOff { .. }));
        let c = r.health.snapshot();
        assert_eq!(c.status_code, 500);
        assert_eq!(c.backoff_requests, 1);
        assert_eq!(r.transport.call_count(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(r.drainer.tick().await.unwrap(), TickResult::Finished { sent: 1 });
    }

    #[tokio::test]
    async fn health_failure_is_not_retried() {
        let r = rig(MockTransport::new(vec![MockReply::status(503)]));
        let hc = r.queue.enqueue(RequestBlob::new(RequestKind::Health, Vec::new())).unwrap();
        assert_eq!(r.drainer.tick().await.unwrap(), TickResult::Finished { sent: 0 });
        assert_eq!(
            hc.outcome().await,
            Some(RequestOutcome::Dropped { reason: DropReason::HealthNotRetried })
        );
        assert_eq!(r.health.snapshot().status_code, -1);
    }

    #[tokio::test]
    async fn health_goes_after_other_requests() {
        let r = rig(MockTransport::accepting());
        r.queue.enqueue(RequestBlob::new(RequestKind::Health, Vec::new())).unwrap();
        r.queue.enqueue(session()).unwrap();
        r.drainer.tick().await.unwrap();
        let kinds: Vec<_> = r.transport.sent().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![RequestKind::Session, RequestKind::Health]);
    }

    #[tokio::test]
    async fn crawler_drops_without_sending() {
        let crawler = CrawlerConfig {
            device_name: Some("Calypso AppCrawler".into()),
            ..Default::default()
        };
        let r = rig_with(MockTransport::accepting(), crawler, None);
        let handle = r.queue.enqueue(session()).unwrap();
        assert_eq!(r.drainer.tick().await.unwrap(), TickResult::Finished { sent: 0 });
        assert_eq!(
            handle.outcome().await,
            Some(RequestOutcome::Dropped { reason: DropReason::Crawler })
        );
        assert_eq!(r.transport.call_count(), 0);
        assert_eq!(r.health.dropped_count(DropReason::Crawler), 1);
    }

    #[tokio::test]
    async fn too_old_dropped_without_sending() {
        let r = rig_with(MockTransport::accepting(), CrawlerConfig::default(), Some(Duration::from_secs(3600)));
        let old = session().with_created_at(chrono::Utc::now().timestamp_millis() - 2 * 3_600_000);
        let stale = r.queue.enqueue(old).unwrap();
        let fresh = r.queue.enqueue(session()).unwrap();
        assert_eq!(r.drainer.tick().await.unwrap(), TickResult::Finished { sent: 1 });
        assert_eq!(
            stale.outcome().await,
            Some(RequestOutcome::Dropped { reason: DropReason::TooOld })
        );
        assert_eq!(fresh.outcome().await, Some(RequestOutcome::Delivered));
        assert_eq!(r.health.dropped_count(DropReason::TooOld), 1);
    }

    #[tokio::test]
    async fn temporary_stamped_requests_wait() {
        let r = rig(MockTransport::accepting());
        r.identity.change_without_merge(TEMPORARY_DEVICE_ID).unwrap();
        r.queue.enqueue(session()).unwrap();
        assert_eq!(r.drainer.tick().await.unwrap(), TickResult::Stalled { sent: 0 });
        assert_eq!(r.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_tick_is_noop() {
        let r = rig(MockTransport::new(vec![MockReply::delayed(
            Duration::from_millis(50),
            MockReply::Accept,
        )]));
        r.queue.enqueue(session()).unwrap();
        let (first, second) = tokio::join!(r.drainer.tick(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            r.drainer.tick().await
        });
        assert_eq!(first.unwrap(), TickResult::Finished { sent: 1 });
        assert_eq!(second.unwrap(), TickResult::AlreadyRunning);
        assert_eq!(r.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_drainer_sends_nothing() {
        let r = rig(MockTransport::accepting());
        r.queue.enqueue(session()).unwrap();
        r.drainer.cancel.cancel();
        assert_eq!(r.drainer.tick().await.unwrap(), TickResult::ShutDown);
        assert_eq!(r.transport.call_count(), 0);
    }
}
