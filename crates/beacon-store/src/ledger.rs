use beacon_core::{EventRecord, RequestBlob, RequestId};

use crate::error::StoreError;

/// Result of appending to a bounded ledger.
#[derive(Debug, Default)]
pub struct AppendOutcome {
    /// Oldest blobs removed to make room, oldest first.
    pub evicted: Vec<RequestBlob>,
    /// Tokens of undecodable rows removed while making room.
    pub discarded: Vec<RequestId>,
}

/// Result of looking for the next blob to send.
#[derive(Debug, Default)]
pub struct Peek {
    pub entry: Option<RequestBlob>,
    /// Tokens of rows that could not be decoded and were deleted on the way.
    pub discarded: Vec<RequestId>,
}

/// Result of moving the buffered events into the ledger.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub blob: Option<RequestBlob>,
    pub flushed_events: usize,
    pub evicted: Vec<RequestBlob>,
    pub discarded: Vec<RequestId>,
}

/// Ordered, durable queue of outgoing request blobs.
///
/// Each call is atomic. Blob tokens (`RequestBlob::id`) stay valid across
/// `replace_all` even though ordering positions may be renumbered.
pub trait RequestLedger: Send + Sync {
    /// Append after the newest blob. If the ledger already holds `capacity`
    /// blobs, the oldest are evicted first.
    fn append(&self, blob: &RequestBlob, capacity: usize) -> Result<AppendOutcome, StoreError>;

    /// Remove a blob by token. Returns false if it was already gone.
    fn remove(&self, id: &RequestId) -> Result<bool, StoreError>;

    /// Oldest blob accepted by `sendable`. Blobs rejected by the predicate
    /// stay in place. Undecodable rows are deleted and reported.
    fn peek(&self, sendable: &dyn Fn(&RequestBlob) -> bool) -> Result<Peek, StoreError>;

    fn peek_oldest(&self) -> Result<Peek, StoreError> {
        self.peek(&|_| true)
    }

    /// Remove every blob matching `doomed`, returning them oldest first.
    fn remove_matching(&self, doomed: &dyn Fn(&RequestBlob) -> bool) -> Result<Vec<RequestBlob>, StoreError>;

    /// Atomically replace the whole ledger with `rewrite(current)` and
    /// write `state` entries in the same commit. Undecodable rows never
    /// reach `rewrite`; their tokens are returned.
    fn replace_all(
        &self,
        rewrite: &mut dyn FnMut(Vec<RequestBlob>) -> Vec<RequestBlob>,
        state: &[(String, String)],
    ) -> Result<Vec<RequestId>, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn contains_identity_change(&self) -> Result<bool, StoreError>;

    /// Every decodable blob, oldest first.
    fn list(&self) -> Result<Vec<RequestBlob>, StoreError>;
}

/// Bounded buffer of events not yet batched into a request.
pub trait EventStore: Send + Sync {
    /// Push a record, evicting the oldest ones while at `capacity`.
    fn push_event(&self, event: &EventRecord, capacity: usize) -> Result<Vec<EventRecord>, StoreError>;

    fn event_count(&self) -> Result<usize, StoreError>;

    fn list_events(&self) -> Result<Vec<EventRecord>, StoreError>;

    /// In one transaction: read the buffered events, let `build` turn them
    /// into a blob, append it to the ledger and clear the buffer.
    /// `build` is not called when the buffer is empty; returning `None`
    /// leaves the buffer untouched.
    fn flush_events(
        &self,
        build: &mut dyn FnMut(&[EventRecord]) -> Option<RequestBlob>,
        ledger_capacity: usize,
    ) -> Result<FlushOutcome, StoreError>;
}

/// Scalar key/value state (device id, id mode, health counters, consent).
pub trait StateStore: Send + Sync {
    fn get_state(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove_state(&self, key: &str) -> Result<(), StoreError>;
}

/// Everything the pipeline persists, on a single backend.
pub trait Storage: RequestLedger + EventStore + StateStore {}

impl<T: RequestLedger + EventStore + StateStore> Storage for T {}
