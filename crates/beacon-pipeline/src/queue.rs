//! Producer-side entry into the ledger.

use std::sync::Arc;

use tracing::{debug, warn};

use beacon_core::{EventRecord, RequestBlob, RequestId};

use crate::error::Result;
use crate::health::HealthTracker;
use crate::identity::IdentityManager;
use crate::outcome::{DropReason, OutcomeRegistry, RequestHandle, RequestOutcome};

/// Registers a completion handle, stamps the blob through the identity
/// manager and appends it. Blobs evicted to make room are resolved as
/// dropped and counted.
pub struct RequestQueue {
    identity: Arc<IdentityManager>,
    registry: Arc<OutcomeRegistry>,
    health: Arc<HealthTracker>,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(
        identity: Arc<IdentityManager>,
        registry: Arc<OutcomeRegistry>,
        health: Arc<HealthTracker>,
        capacity: usize,
    ) -> Self {
        Self {
            identity,
            registry,
            health,
            capacity,
        }
    }

    pub fn enqueue(&self, blob: RequestBlob) -> Result<RequestHandle> {
        let id = blob.id.clone();
        let kind = blob.kind;
        let handle = self.registry.register(&id);
        match self.identity.append(blob, self.capacity) {
            Ok(outcome) => {
                debug!(request_id = %id, %kind, "request queued");
                self.resolve_dropped(outcome.evicted, DropReason::Evicted);
                self.resolve_dropped_ids(outcome.discarded, DropReason::Corrupt);
                Ok(handle)
            }
            Err(e) => {
                self.registry.cancel(&id);
                self.health.log_error();
                Err(e.into())
            }
        }
    }

    /// Batch the buffered events into one blob. `None` when there was
    /// nothing to flush.
    pub fn flush_events(
        &self,
        build: &mut dyn FnMut(&[EventRecord]) -> Option<RequestBlob>,
    ) -> Result<Option<RequestHandle>> {
        let id = RequestId::new();
        let handle = self.registry.register(&id);
        let result = self.identity.flush_events(
            &mut |events| {
                build(events).map(|mut blob| {
                    blob.id = id.clone();
                    blob
                })
            },
            self.capacity,
        );
        match result {
            Ok(outcome) => {
                self.resolve_dropped(outcome.evicted, DropReason::Evicted);
                self.resolve_dropped_ids(outcome.discarded, DropReason::Corrupt);
                if outcome.blob.is_some() {
                    debug!(request_id = %id, events = outcome.flushed_events, "events flushed");
                    Ok(Some(handle))
                } else {
                    self.registry.cancel(&id);
                    Ok(None)
                }
            }
            Err(e) => {
                self.registry.cancel(&id);
                self.health.log_error();
                Err(e.into())
            }
        }
    }

    pub fn resolve_dropped(&self, blobs: Vec<RequestBlob>, reason: DropReason) {
        if blobs.is_empty() {
            return;
        }
        warn!(count = blobs.len(), reason = reason.as_str(), "requests dropped unsent");
        self.health.log_dropped(reason, blobs.len());
        for blob in blobs {
            self.registry.resolve(&blob.id, RequestOutcome::Dropped { reason });
        }
    }

    pub fn resolve_dropped_ids(&self, ids: Vec<RequestId>, reason: DropReason) {
        if ids.is_empty() {
            return;
        }
        warn!(count = ids.len(), reason = reason.as_str(), "requests dropped unsent");
        self.health.log_dropped(reason, ids.len());
        for id in ids {
            self.registry.resolve(&id, RequestOutcome::Dropped { reason });
        }
    }

    pub fn registry(&self) -> &Arc<OutcomeRegistry> {
        &self.registry
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
