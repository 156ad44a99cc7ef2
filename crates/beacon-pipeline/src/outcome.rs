//! Per-request completion and the queue-finished broadcast.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::trace;

use beacon_core::RequestId;

/// Why a blob left the ledger without being delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Older than the configured maximum request age.
    TooOld,
    /// The device was identified as an app crawler.
    Crawler,
    /// Pushed out by a newer blob while the ledger was full.
    Evicted,
    /// Stranded by a non-merging identity change.
    IdentityPurged,
    /// Row could not be decoded.
    Corrupt,
    /// Health reports are sent once and never retried.
    HealthNotRetried,
    /// The whole ledger was cleared on request.
    Cleared,
    /// Stamped with an app key other than the configured one.
    WrongAppKey,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooOld => "too_old",
            Self::Crawler => "crawler",
            Self::Evicted => "evicted",
            Self::IdentityPurged => "identity_purged",
            Self::Corrupt => "corrupt",
            Self::HealthNotRetried => "health_not_retried",
            Self::Cleared => "cleared",
            Self::WrongAppKey => "wrong_app_key",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RequestOutcome {
    Delivered,
    /// Send attempt failed; the blob stays queued for a later retry.
    Failed { error: String },
    Dropped { reason: DropReason },
}

impl RequestOutcome {
    /// Callback form: `(response, success)`.
    pub fn as_callback(&self) -> (Option<String>, bool) {
        match self {
            Self::Delivered => (None, true),
            Self::Failed { error } => (Some(error.clone()), false),
            Self::Dropped { reason } => (Some(reason.as_str().to_owned()), false),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Receiving side of one enqueued blob's completion.
#[derive(Debug)]
pub struct RequestHandle {
    pub id: RequestId,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl RequestHandle {
    /// First outcome the blob reached. `None` if the pipeline was dropped
    /// before anything happened to it.
    pub async fn outcome(self) -> Option<RequestOutcome> {
        self.rx.await.ok()
    }

    pub fn try_outcome(&mut self) -> Option<RequestOutcome> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    QueueFinished,
}

/// Outstanding completion channels, keyed by blob token.
pub struct OutcomeRegistry {
    pending: DashMap<RequestId, oneshot::Sender<RequestOutcome>>,
    queue_tx: broadcast::Sender<QueueEvent>,
}

impl Default for OutcomeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeRegistry {
    pub fn new() -> Self {
        let (queue_tx, _) = broadcast::channel(64);
        Self {
            pending: DashMap::new(),
            queue_tx,
        }
    }

    /// Must be called before the blob becomes visible to the drainer.
    pub fn register(&self, id: &RequestId) -> RequestHandle {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        RequestHandle { id: id.clone(), rx }
    }

    /// Resolve and forget. Later resolutions of the same token are ignored.
    pub fn resolve(&self, id: &RequestId, outcome: RequestOutcome) -> bool {
        match self.pending.remove(id) {
            Some((_, tx)) => {
                trace!(request_id = %id, ?outcome, "request resolved");
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forget a registration whose blob never made it into the ledger.
    pub fn cancel(&self, id: &RequestId) {
        self.pending.remove(id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue_tx.subscribe()
    }

    pub fn queue_finished(&self) {
        let _ = self.queue_tx.send(QueueEvent::QueueFinished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_resolution_wins() {
        let reg = OutcomeRegistry::new();
        let id = RequestId::new();
        let handle = reg.register(&id);
        assert!(reg.resolve(&id, RequestOutcome::Failed { error: "offline".into() }));
        assert!(!reg.resolve(&id, RequestOutcome::Delivered));
        assert_eq!(
            handle.outcome().await,
            Some(RequestOutcome::Failed { error: "offline".into() })
        );
        assert_eq!(reg.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_registry_yields_none() {
        let reg = OutcomeRegistry::new();
        let handle = reg.register(&RequestId::new());
        drop(reg);
        assert_eq!(handle.outcome().await, None);
    }

    #[test]
    fn callback_shapes() {
        assert_eq!(RequestOutcome::Delivered.as_callback(), (None, true));
        assert_eq!(
            RequestOutcome::Dropped { reason: DropReason::TooOld }.as_callback(),
            (Some("too_old".into()), false)
        );
    }

    #[tokio::test]
    async fn queue_finished_reaches_subscribers() {
        let reg = OutcomeRegistry::new();
        let mut rx = reg.subscribe();
        reg.queue_finished();
        assert_eq!(rx.recv().await.unwrap(), QueueEvent::QueueFinished);
    }
}
