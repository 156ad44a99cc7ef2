//! Per-session begin / update / end ordering and leadership.
//!
//! Only the leading session writes session requests to the ledger. Every
//! other session builds its requests at call time and holds them until it
//! is promoted. State changes and the matching ledger write happen under
//! one lock, so a session's requests reach the ledger in call order no
//! matter which thread produces them.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use beacon_core::RequestBlob;

use crate::error::Result;
use crate::health::HealthTracker;
use crate::outcome::{DropReason, RequestHandle};

/// Opaque handle; ordering follows creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Which session request to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRequest {
    Begin,
    Update { duration_secs: u64 },
    End { duration_secs: u64 },
}

/// Builds session requests and writes them to the ledger.
///
/// Called with the tracker lock held; `emit` must not block on network I/O.
pub trait SessionSink {
    fn build(&self, request: SessionRequest) -> Result<RequestBlob>;

    fn emit(&self, blob: RequestBlob) -> Result<RequestHandle>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Began { last_update: Instant },
    /// Ended while not leading; removed once its held requests are out.
    Ended,
}

#[derive(Debug)]
struct Tracked {
    phase: Phase,
    held: VecDeque<RequestBlob>,
}

#[derive(Debug, Default)]
struct Sessions {
    next_id: u64,
    live: BTreeMap<SessionHandle, Tracked>,
    leading: Option<SessionHandle>,
}

impl Sessions {
    fn phase(&self, handle: SessionHandle) -> Option<Phase> {
        self.live.get(&handle).map(|t| t.phase)
    }

    /// Oldest session with requests of its own, in creation order.
    fn next_leader(&self) -> Option<SessionHandle> {
        self.live
            .iter()
            .find(|(_, t)| t.phase != Phase::Created)
            .map(|(h, _)| *h)
    }

    fn leads(&self, handle: SessionHandle) -> bool {
        self.leading.map_or(true, |l| l == handle)
    }

    /// Leading with nothing still held, so a new request may skip the queue.
    fn writes_directly(&self, handle: SessionHandle) -> bool {
        self.leads(handle) && self.live.get(&handle).map_or(true, |t| t.held.is_empty())
    }

    fn hold(&mut self, handle: SessionHandle, blob: RequestBlob) {
        if let Some(tracked) = self.live.get_mut(&handle) {
            tracked.held.push_back(blob);
        }
    }
}

/// Tracks every live session. A session is removed once its end request
/// is in the ledger.
///
/// A session that begins while none leads takes the lead. When the leader
/// ends, the lead passes to the oldest remaining session that has begun,
/// whose held requests are then written in order.
pub struct SessionTracker {
    inner: Mutex<Sessions>,
    health: Arc<HealthTracker>,
}

impl SessionTracker {
    pub fn new(health: Arc<HealthTracker>) -> Self {
        Self {
            inner: Mutex::new(Sessions::default()),
            health,
        }
    }

    pub fn create(&self) -> SessionHandle {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let handle = SessionHandle(inner.next_id);
        inner.live.insert(
            handle,
            Tracked {
                phase: Phase::Created,
                held: VecDeque::new(),
            },
        );
        handle
    }

    /// `Some` when the begin request went straight to the ledger, `None`
    /// when it is held or the call was ignored.
    pub fn begin(
        &self,
        handle: SessionHandle,
        now: Instant,
        sink: &dyn SessionSink,
    ) -> Result<Option<RequestHandle>> {
        let mut inner = self.inner.lock();
        self.release(&mut inner, sink);
        match inner.phase(handle) {
            Some(Phase::Created) => {}
            Some(Phase::Began { .. }) => {
                warn!(%handle, "begin called on a session that is already running");
                self.health.log_session_started_while_running();
                self.health.log_warning();
                return Ok(None);
            }
            Some(Phase::Ended) | None => {
                warn!(%handle, "begin called on an unknown or ended session");
                self.health.log_warning();
                return Ok(None);
            }
        }

        let blob = sink.build(SessionRequest::Begin)?;
        let queued = if inner.leads(handle) {
            let queued = sink.emit(blob)?;
            inner.leading = Some(handle);
            debug!(%handle, "session is now leading");
            Some(queued)
        } else {
            inner.hold(handle, blob);
            debug!(%handle, "session is not leading, holding begin");
            None
        };
        if let Some(tracked) = inner.live.get_mut(&handle) {
            tracked.phase = Phase::Began { last_update: now };
        }
        Ok(queued)
    }

    /// Queue or hold an update carrying the seconds since the last begin
    /// or update.
    pub fn update(
        &self,
        handle: SessionHandle,
        now: Instant,
        sink: &dyn SessionSink,
    ) -> Result<Option<RequestHandle>> {
        let mut inner = self.inner.lock();
        self.release(&mut inner, sink);
        let Some(Phase::Began { last_update }) = inner.phase(handle) else {
            warn!(%handle, "update called on a session that is not running");
            self.health.log_session_updated_while_not_running();
            self.health.log_warning();
            return Ok(None);
        };

        let duration_secs = now.saturating_duration_since(last_update).as_secs();
        let blob = sink.build(SessionRequest::Update { duration_secs })?;
        let queued = if inner.writes_directly(handle) {
            Some(sink.emit(blob)?)
        } else {
            inner.hold(handle, blob);
            None
        };
        if let Some(tracked) = inner.live.get_mut(&handle) {
            tracked.phase = Phase::Began { last_update: now };
        }
        Ok(queued)
    }

    /// Queue or hold the end request. The leader is forgotten only after
    /// its end request is in the ledger; a failed write leaves it running.
    pub fn end(
        &self,
        handle: SessionHandle,
        now: Instant,
        sink: &dyn SessionSink,
    ) -> Result<Option<RequestHandle>> {
        let mut inner = self.inner.lock();
        self.release(&mut inner, sink);
        let Some(Phase::Began { last_update }) = inner.phase(handle) else {
            warn!(%handle, "end called on a session that is not running");
            self.health.log_session_ended_while_not_running();
            self.health.log_warning();
            return Ok(None);
        };

        let duration_secs = now.saturating_duration_since(last_update).as_secs();
        let blob = sink.build(SessionRequest::End { duration_secs })?;
        if !inner.writes_directly(handle) {
            inner.hold(handle, blob);
            if let Some(tracked) = inner.live.get_mut(&handle) {
                tracked.phase = Phase::Ended;
            }
            debug!(%handle, "session ended while waiting to lead, holding its requests");
            return Ok(None);
        }

        let queued = sink.emit(blob)?;
        inner.live.remove(&handle);
        inner.leading = None;
        self.release(&mut inner, sink);
        debug!(ended = %handle, promoted = ?inner.leading, "leading session ended");
        Ok(Some(queued))
    }

    /// Stop every running session for a non-merging identity change.
    ///
    /// The leader's end request is written through `sink`. Requests held
    /// by other sessions belong to the abandoned identity and are dropped.
    /// Returns the sessions that were running, in creation order, so they
    /// can be begun again.
    pub fn end_all(&self, now: Instant, sink: &dyn SessionSink) -> Result<Vec<SessionHandle>> {
        let mut inner = self.inner.lock();
        self.release(&mut inner, sink);
        if let Some(leader) = inner.leading.filter(|l| inner.writes_directly(*l)) {
            if let Some(Phase::Began { last_update }) = inner.phase(leader) {
                let duration_secs = now.saturating_duration_since(last_update).as_secs();
                debug!(session = %leader, "ending session under the old device id");
                sink.emit(sink.build(SessionRequest::End { duration_secs })?)?;
            }
        }

        let mut running = Vec::new();
        let mut dropped = 0;
        inner.live.retain(|handle, tracked| {
            dropped += tracked.held.len();
            tracked.held.clear();
            match tracked.phase {
                Phase::Began { .. } => {
                    running.push(*handle);
                    tracked.phase = Phase::Created;
                    true
                }
                Phase::Ended => false,
                Phase::Created => true,
            }
        });
        inner.leading = None;
        if dropped > 0 {
            warn!(dropped, "dropped session requests held for the old device id");
            self.health.log_dropped(DropReason::IdentityPurged, dropped);
        }
        Ok(running)
    }

    /// Automatic update for the leading session once `interval` has passed
    /// since its last update.
    pub fn heartbeat(
        &self,
        now: Instant,
        interval: Duration,
        sink: &dyn SessionSink,
    ) -> Result<Option<(SessionHandle, u64)>> {
        let mut inner = self.inner.lock();
        self.release(&mut inner, sink);
        let Some(leader) = inner.leading.filter(|l| inner.writes_directly(*l)) else {
            return Ok(None);
        };
        let Some(Phase::Began { last_update }) = inner.phase(leader) else {
            return Ok(None);
        };
        let elapsed = now.saturating_duration_since(last_update);
        if elapsed < interval {
            return Ok(None);
        }
        let duration_secs = elapsed.as_secs();
        sink.emit(sink.build(SessionRequest::Update { duration_secs })?)?;
        if let Some(tracked) = inner.live.get_mut(&leader) {
            tracked.phase = Phase::Began { last_update: now };
        }
        Ok(Some((leader, duration_secs)))
    }

    /// Write the leader's held requests, promoting past sessions that
    /// already ended. A failed write keeps the rest held for the next call.
    fn release(&self, inner: &mut Sessions, sink: &dyn SessionSink) {
        loop {
            let Some(leader) = inner.leading.or_else(|| inner.next_leader()) else {
                return;
            };
            if inner.leading.is_none() {
                debug!(session = %leader, "promoted to leading session");
            }
            inner.leading = Some(leader);
            let Some(tracked) = inner.live.get_mut(&leader) else {
                inner.leading = None;
                continue;
            };
            while let Some(blob) = tracked.held.pop_front() {
                if let Err(e) = sink.emit(blob.clone()) {
                    warn!(session = %leader, error = %e, "failed to release held session request");
                    tracked.held.push_front(blob);
                    return;
                }
            }
            if tracked.phase != Phase::Ended {
                return;
            }
            inner.live.remove(&leader);
            inner.leading = None;
        }
    }

    pub fn leading(&self) -> Option<SessionHandle> {
        self.inner.lock().leading
    }

    pub fn running(&self) -> Vec<SessionHandle> {
        self.inner
            .lock()
            .live
            .iter()
            .filter(|(_, t)| matches!(t.phase, Phase::Began { .. }))
            .map(|(h, _)| *h)
            .collect()
    }

    /// Requests waiting for their session to lead.
    pub fn held_requests(&self) -> usize {
        self.inner.lock().live.values().map(|t| t.held.len()).sum()
    }
}
