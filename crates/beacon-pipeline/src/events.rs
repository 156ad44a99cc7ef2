use std::sync::Arc;

use tracing::{debug, warn};

use beacon_core::{EventRecord, TimeInstant};
use beacon_store::Storage;

use crate::encoder::RequestEncoder;
use crate::error::Result;
use crate::health::HealthTracker;
use crate::outcome::RequestHandle;
use crate::queue::RequestQueue;

/// Outcome of recording one event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub recorded: bool,
    /// Older events pushed out of the full buffer.
    pub evicted: usize,
    /// Buffer reached the flush threshold.
    pub flush_due: bool,
}

/// Bounded event buffer in front of the ledger. Events are batched into a
/// single request on flush.
pub struct EventQueue {
    storage: Arc<dyn Storage>,
    encoder: Arc<RequestEncoder>,
    queue: Arc<RequestQueue>,
    health: Arc<HealthTracker>,
    capacity: usize,
    flush_threshold: usize,
}

impl EventQueue {
    pub fn new(
        storage: Arc<dyn Storage>,
        encoder: Arc<RequestEncoder>,
        queue: Arc<RequestQueue>,
        health: Arc<HealthTracker>,
        capacity: usize,
        flush_threshold: usize,
    ) -> Self {
        Self {
            storage,
            encoder,
            queue,
            health,
            capacity: capacity.max(1),
            flush_threshold: flush_threshold.clamp(1, capacity.max(1)),
        }
    }

    pub fn record(&self, event: EventRecord) -> Result<RecordOutcome> {
        let Some(event) = self.encoder.normalize_event(event) else {
            return Ok(RecordOutcome::default());
        };
        let evicted = self.storage.push_event(&event, self.capacity)?;
        if !evicted.is_empty() {
            warn!(
                evicted = evicted.len(),
                capacity = self.capacity,
                "event buffer full, dropped oldest events"
            );
            self.health.log_events_evicted(evicted.len());
        }
        let buffered = self.storage.event_count()?;
        debug!(key = %event.key, buffered, "event recorded");
        Ok(RecordOutcome {
            recorded: true,
            evicted: evicted.len(),
            flush_due: buffered >= self.flush_threshold,
        })
    }

    pub fn buffered(&self) -> Result<usize> {
        Ok(self.storage.event_count()?)
    }

    pub fn flush(&self) -> Result<Option<RequestHandle>> {
        let encoder = &self.encoder;
        let health = &self.health;
        self.queue.flush_events(&mut |events| {
            match encoder.events_blob(events, TimeInstant::now()) {
                Ok(blob) => Some(blob),
                Err(e) => {
                    warn!(error = %e, "failed to encode event batch, keeping events buffered");
                    health.log_error();
                    None
                }
            }
        })
    }
}
