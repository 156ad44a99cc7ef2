use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use beacon_core::{EventRecord, RequestBlob, RequestId, RequestKind};

use crate::error::StoreError;
use crate::ledger::{AppendOutcome, EventStore, FlushOutcome, Peek, RequestLedger, StateStore};

#[derive(Default)]
struct Inner {
    requests: VecDeque<RequestBlob>,
    events: VecDeque<EventRecord>,
    state: HashMap<String, String>,
}

/// In-process storage with the same semantics as `SqliteStorage`,
/// minus durability. One mutex covers all three collections.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn evict_for_one_more<T>(queue: &mut VecDeque<T>, capacity: usize) -> Vec<T> {
    let capacity = capacity.max(1);
    let mut evicted = Vec::new();
    while queue.len() >= capacity {
        match queue.pop_front() {
            Some(item) => evicted.push(item),
            None => break,
        }
    }
    evicted
}

impl RequestLedger for MemoryStorage {
    fn append(&self, blob: &RequestBlob, capacity: usize) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let evicted = evict_for_one_more(&mut inner.requests, capacity);
        inner.requests.push_back(blob.clone());
        Ok(AppendOutcome {
            evicted,
            discarded: Vec::new(),
        })
    }

    fn remove(&self, id: &RequestId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.requests.iter().position(|b| &b.id == id) {
            Some(idx) => {
                inner.requests.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn peek(&self, sendable: &dyn Fn(&RequestBlob) -> bool) -> Result<Peek, StoreError> {
        let inner = self.inner.lock();
        Ok(Peek {
            entry: inner.requests.iter().find(|b| sendable(b)).cloned(),
            discarded: Vec::new(),
        })
    }

    fn remove_matching(&self, doomed: &dyn Fn(&RequestBlob) -> bool) -> Result<Vec<RequestBlob>, StoreError> {
        let mut inner = self.inner.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = inner.requests.drain(..).partition(|b| doomed(b));
        inner.requests = kept.into();
        Ok(removed)
    }

    fn replace_all(
        &self,
        rewrite: &mut dyn FnMut(Vec<RequestBlob>) -> Vec<RequestBlob>,
        state: &[(String, String)],
    ) -> Result<Vec<RequestId>, StoreError> {
        let mut inner = self.inner.lock();
        let current: Vec<RequestBlob> = inner.requests.drain(..).collect();
        inner.requests = rewrite(current).into();
        for (key, value) in state {
            inner.state.insert(key.clone(), value.clone());
        }
        Ok(Vec::new())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().requests.len())
    }

    fn contains_identity_change(&self) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .requests
            .iter()
            .any(|b| b.kind == RequestKind::IdentityChange))
    }

    fn list(&self) -> Result<Vec<RequestBlob>, StoreError> {
        Ok(self.inner.lock().requests.iter().cloned().collect())
    }
}

impl EventStore for MemoryStorage {
    fn push_event(&self, event: &EventRecord, capacity: usize) -> Result<Vec<EventRecord>, StoreError> {
        let mut inner = self.inner.lock();
        let evicted = evict_for_one_more(&mut inner.events, capacity);
        inner.events.push_back(event.clone());
        Ok(evicted)
    }

    fn event_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().events.len())
    }

    fn list_events(&self) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.inner.lock().events.iter().cloned().collect())
    }

    fn flush_events(
        &self,
        build: &mut dyn FnMut(&[EventRecord]) -> Option<RequestBlob>,
        ledger_capacity: usize,
    ) -> Result<FlushOutcome, StoreError> {
        let mut inner = self.inner.lock();
        if inner.events.is_empty() {
            return Ok(FlushOutcome::default());
        }
        let events: Vec<EventRecord> = inner.events.iter().cloned().collect();
        let Some(blob) = build(&events) else {
            return Ok(FlushOutcome::default());
        };
        let evicted = evict_for_one_more(&mut inner.requests, ledger_capacity);
        inner.requests.push_back(blob.clone());
        inner.events.clear();
        Ok(FlushOutcome {
            blob: Some(blob),
            flushed_events: events.len(),
            evicted,
            discarded: Vec::new(),
        })
    }
}

impl StateStore for MemoryStorage {
    fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().state.get(key).cloned())
    }

    fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.lock().state.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_state(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().state.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::TimeInstant;

    fn blob(kind: RequestKind) -> RequestBlob {
        RequestBlob::new(kind, Vec::new())
    }

    #[test]
    fn capacity_eviction_reports_oldest() {
        let s = MemoryStorage::new();
        let first = blob(RequestKind::Events);
        s.append(&first, 1).unwrap();
        let out = s.append(&blob(RequestKind::Events), 1).unwrap();
        assert_eq!(out.evicted, vec![first]);
        assert_eq!(s.len().unwrap(), 1);
    }

    #[test]
    fn identity_change_detection() {
        let s = MemoryStorage::new();
        s.append(&blob(RequestKind::Session), 10).unwrap();
        assert!(!s.contains_identity_change().unwrap());
        s.append(&blob(RequestKind::IdentityChange), 10).unwrap();
        assert!(s.contains_identity_change().unwrap());
    }

    #[test]
    fn remove_matching_keeps_order_of_rest() {
        let s = MemoryStorage::new();
        let a = blob(RequestKind::Session);
        let b = blob(RequestKind::Health);
        let c = blob(RequestKind::Session);
        for x in [&a, &b, &c] {
            s.append(x, 10).unwrap();
        }
        let removed = s.remove_matching(&|x| x.kind == RequestKind::Health).unwrap();
        assert_eq!(removed, vec![b]);
        assert_eq!(s.list().unwrap(), vec![a, c]);
    }

    #[test]
    fn flush_respects_ledger_capacity() {
        let s = MemoryStorage::new();
        let old = blob(RequestKind::Session);
        s.append(&old, 1).unwrap();
        s.push_event(&EventRecord::new("a", TimeInstant::now()), 5).unwrap();
        let out = s
            .flush_events(&mut |_| Some(blob(RequestKind::Events)), 1)
            .unwrap();
        assert_eq!(out.evicted, vec![old]);
        assert_eq!(out.flushed_events, 1);
        assert_eq!(s.event_count().unwrap(), 0);
    }
}
