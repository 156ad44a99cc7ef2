//! Device identity ownership and ledger rewrites on identity transitions.
//!
//! The current identity sits behind a read/write lock. Every ledger write
//! that stamps a device id takes the read side, and every transition takes
//! the write side for the duration of its single `replace_all` commit, so
//! appends are serialized behind a rewrite and never observe a half-applied
//! transition. Network I/O never happens under this lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use beacon_core::{
    DeviceIdMode, DeviceIdentity, EventRecord, RequestBlob, RequestId, TEMPORARY_DEVICE_ID,
};
use beacon_store::{AppendOutcome, FlushOutcome, Peek, Storage, StoreError};

use crate::error::{PipelineError, Result};

pub const DEVICE_ID_KEY: &str = "device_id";
pub const DEVICE_ID_MODE_KEY: &str = "device_id_mode";
pub const OLD_DEVICE_ID_PARAM: &str = "old_device_id";

/// What a transition did to the ledger.
#[derive(Debug, Default)]
pub struct TransitionReport {
    /// Blobs removed because their identity was abandoned.
    pub purged: Vec<RequestBlob>,
    /// Blobs whose stamped id was replaced.
    pub rewritten: usize,
    /// Token of the inserted change-id blob, for merging changes.
    pub change_request: Option<RequestId>,
    pub previous: Option<DeviceIdentity>,
    /// Tokens of undecodable rows dropped by the rewrite.
    pub discarded: Vec<RequestId>,
}

impl TransitionReport {
    pub fn is_noop(&self) -> bool {
        self.previous.is_none()
    }
}

pub struct IdentityManager {
    current: RwLock<DeviceIdentity>,
    transitioning: AtomicBool,
    storage: Arc<dyn Storage>,
}

impl IdentityManager {
    /// A persisted identity wins over configuration; otherwise a supplied
    /// id, then temporary mode, then a generated id.
    pub fn load_or_init(
        storage: Arc<dyn Storage>,
        supplied: Option<&str>,
        start_temporary: bool,
    ) -> Result<Self> {
        let stored_id = storage.get_state(DEVICE_ID_KEY)?;
        let stored_mode = storage
            .get_state(DEVICE_ID_MODE_KEY)?
            .and_then(|m| DeviceIdMode::parse(&m));

        let identity = match (stored_id, stored_mode) {
            (Some(id), Some(mode)) if !id.is_empty() => {
                debug!(device_id = %id, mode = mode.as_str(), "restored device identity");
                DeviceIdentity { id, mode }
            }
            _ => {
                let fresh = match supplied.filter(|s| !s.is_empty()) {
                    Some(id) if id == TEMPORARY_DEVICE_ID => DeviceIdentity::temporary(),
                    Some(id) => DeviceIdentity::developer(id),
                    None if start_temporary => DeviceIdentity::temporary(),
                    None => DeviceIdentity::generated(),
                };
                storage.set_state(DEVICE_ID_KEY, &fresh.id)?;
                storage.set_state(DEVICE_ID_MODE_KEY, fresh.mode.as_str())?;
                info!(device_id = %fresh.id, mode = fresh.mode.as_str(), "initialized device identity");
                fresh
            }
        };

        Ok(Self {
            current: RwLock::new(identity),
            transitioning: AtomicBool::new(false),
            storage,
        })
    }

    pub fn current(&self) -> DeviceIdentity {
        self.current.read().clone()
    }

    pub fn is_temporary(&self) -> bool {
        self.current.read().is_temporary()
    }

    pub fn is_transitioning(&self) -> bool {
        self.transitioning.load(Ordering::Acquire)
    }

    /// Stamp with the current identity and append.
    pub fn append(&self, mut blob: RequestBlob, capacity: usize) -> std::result::Result<AppendOutcome, StoreError> {
        let identity = self.current.read();
        if blob.requires_device_id {
            blob.device_id = Some(identity.id.clone());
        }
        self.storage.append(&blob, capacity)
    }

    /// Move buffered events into one stamped batch blob.
    pub fn flush_events(
        &self,
        build: &mut dyn FnMut(&[EventRecord]) -> Option<RequestBlob>,
        capacity: usize,
    ) -> std::result::Result<FlushOutcome, StoreError> {
        let identity = self.current.read();
        let id = identity.id.clone();
        self.storage.flush_events(
            &mut |events| {
                build(events).map(|mut blob| {
                    if blob.requires_device_id {
                        blob.device_id = Some(id.clone());
                    }
                    blob
                })
            },
            capacity,
        )
    }

    /// Oldest blob that may go out now and satisfies `filter`.
    ///
    /// Blobs stamped with the temporary id are never sendable. While a
    /// transition holds the write lock, blobs that need the current id are
    /// skipped instead of waiting for the rewrite to finish.
    pub fn peek_sendable(&self, filter: &dyn Fn(&RequestBlob) -> bool) -> std::result::Result<Peek, StoreError> {
        let settled = self.current.try_read().is_some() && !self.is_transitioning();
        self.storage.peek(&|blob| {
            if blob.is_stamped_with(TEMPORARY_DEVICE_ID) {
                return false;
            }
            if blob.requires_device_id && !settled {
                return false;
            }
            filter(blob)
        })
    }

    /// Merging change: the collector re-attributes `old` data to `new_id`.
    ///
    /// The change blob is placed before the oldest pending blob that was
    /// stamped with the old id, so the collector learns the mapping before
    /// it sees any of them. Those blobs keep the old id.
    #[instrument(skip(self, change), fields(new_id = %new_id))]
    pub fn change_with_merge(&self, new_id: &str, mut change: RequestBlob) -> Result<TransitionReport> {
        validate_id(new_id)?;
        let mut current = self.current.write();
        if current.id == new_id {
            debug!("device id unchanged, nothing to do");
            return Ok(TransitionReport::default());
        }
        if current.is_temporary() {
            return self.leave_temporary(&mut current, new_id);
        }
        let _guard = TransitionFlag::raise(&self.transitioning);
        let old = current.clone();

        change.set_param(OLD_DEVICE_ID_PARAM, old.id.clone());
        let change = change.with_fixed_device_id(new_id);
        let change_id = change.id.clone();
        let mut pending = Some(change);

        let discarded = self.storage.replace_all(
            &mut |blobs| {
                let mut out = Vec::with_capacity(blobs.len() + 1);
                for blob in blobs {
                    if blob.requires_device_id && blob.is_stamped_with(&old.id) {
                        if let Some(change) = pending.take() {
                            out.push(change);
                        }
                    }
                    out.push(blob);
                }
                if let Some(change) = pending.take() {
                    out.push(change);
                }
                out
            },
            &identity_state(new_id, DeviceIdMode::DeveloperSupplied),
        )?;

        *current = DeviceIdentity::developer(new_id);
        info!(old_id = %old.id, "device id changed with merge");
        Ok(TransitionReport {
            purged: Vec::new(),
            rewritten: 0,
            change_request: Some(change_id),
            previous: Some(old),
            discarded,
        })
    }

    /// Non-merging change: pending blobs that need the old id are purged.
    #[instrument(skip(self), fields(new_id = %new_id))]
    pub fn change_without_merge(&self, new_id: &str) -> Result<TransitionReport> {
        validate_id(new_id)?;
        let mut current = self.current.write();
        if current.id == new_id {
            debug!("device id unchanged, nothing to do");
            return Ok(TransitionReport::default());
        }
        if current.is_temporary() && new_id != TEMPORARY_DEVICE_ID {
            return self.leave_temporary(&mut current, new_id);
        }
        let _guard = TransitionFlag::raise(&self.transitioning);
        let old = current.clone();
        let next = if new_id == TEMPORARY_DEVICE_ID {
            DeviceIdentity::temporary()
        } else {
            DeviceIdentity::developer(new_id)
        };

        let mut purged = Vec::new();
        let discarded = self.storage.replace_all(
            &mut |blobs| {
                let (gone, kept): (Vec<_>, Vec<_>) = blobs
                    .into_iter()
                    .partition(|b| b.requires_device_id && b.is_stamped_with(&old.id));
                purged = gone;
                kept
            },
            &identity_state(&next.id, next.mode),
        )?;

        if !purged.is_empty() {
            warn!(old_id = %old.id, purged = purged.len(), "purged requests stranded by device id change");
        }
        *current = next;
        info!(old_id = %old.id, mode = current.mode.as_str(), "device id changed without merge");
        Ok(TransitionReport {
            purged,
            rewritten: 0,
            change_request: None,
            previous: Some(old),
            discarded,
        })
    }

    /// Leaving temporary mode rewrites every temp-stamped blob to the new
    /// id. Nothing is purged and no change blob is queued.
    fn leave_temporary(&self, current: &mut DeviceIdentity, new_id: &str) -> Result<TransitionReport> {
        let _guard = TransitionFlag::raise(&self.transitioning);
        let old = current.clone();
        let mut rewritten = 0;
        let discarded = self.storage.replace_all(
            &mut |blobs| {
                blobs
                    .into_iter()
                    .map(|mut b| {
                        if b.is_stamped_with(TEMPORARY_DEVICE_ID) {
                            b.device_id = Some(new_id.to_owned());
                            rewritten += 1;
                        }
                        b
                    })
                    .collect()
            },
            &identity_state(new_id, DeviceIdMode::DeveloperSupplied),
        )?;
        *current = DeviceIdentity::developer(new_id);
        info!(rewritten, "left temporary id mode");
        Ok(TransitionReport {
            purged: Vec::new(),
            rewritten,
            change_request: None,
            previous: Some(old),
            discarded,
        })
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(PipelineError::InvalidArgument("device id must not be empty".into()));
    }
    Ok(())
}

fn identity_state(id: &str, mode: DeviceIdMode) -> [(String, String); 2] {
    [
        (DEVICE_ID_KEY.to_owned(), id.to_owned()),
        (DEVICE_ID_MODE_KEY.to_owned(), mode.as_str().to_owned()),
    ]
}

/// Raised for the lifetime of a transition, lowered on every exit path.
struct TransitionFlag<'a>(&'a AtomicBool);

impl<'a> TransitionFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for TransitionFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::RequestKind;
    use beacon_store::{MemoryStorage, RequestLedger, SqliteStorage, StateStore};

    fn manager_with(storage: Arc<dyn Storage>, id: &str) -> IdentityManager {
        IdentityManager::load_or_init(storage, Some(id), false).unwrap()
    }

    fn session_blob() -> RequestBlob {
        RequestBlob::new(RequestKind::Session, vec![("begin_session".into(), "1".into())])
    }

    fn change_blob() -> RequestBlob {
        RequestBlob::new(RequestKind::IdentityChange, vec![("app_key".into(), "k".into())])
    }

    #[test]
    fn persisted_identity_wins_over_config() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = manager_with(storage.clone(), "dev-a");
        assert_eq!(first.current(), DeviceIdentity::developer("dev-a"));
        let second = manager_with(storage, "dev-b");
        assert_eq!(second.current().id, "dev-a");
    }

    #[test]
    fn generated_or_temporary_when_nothing_supplied() {
        let m = IdentityManager::load_or_init(Arc::new(MemoryStorage::new()), None, false).unwrap();
        assert_eq!(m.current().mode, DeviceIdMode::Generated);
        let t = IdentityManager::load_or_init(Arc::new(MemoryStorage::new()), None, true).unwrap();
        assert!(t.is_temporary());
        assert_eq!(t.current().id, TEMPORARY_DEVICE_ID);
    }

    #[test]
    fn append_stamps_current_id() {
        let storage = Arc::new(MemoryStorage::new());
        let m = manager_with(storage.clone(), "dev-a");
        m.append(session_blob(), 10).unwrap();
        m.append(change_blob().with_fixed_device_id("fixed"), 10).unwrap();
        let blobs = storage.list().unwrap();
        assert!(blobs[0].is_stamped_with("dev-a"));
        assert!(blobs[1].is_stamped_with("fixed"));
    }

    #[test]
    fn merge_places_change_before_old_blobs() {
        let storage = Arc::new(MemoryStorage::new());
        let m = manager_with(storage.clone(), "idA");
        let pending = session_blob();
        m.append(pending.clone(), 10).unwrap();

        let report = m.change_with_merge("idB", change_blob()).unwrap();
        let blobs = storage.list().unwrap();
        assert_eq!(blobs.len(), 2);
        assert_eq!(Some(&blobs[0].id), report.change_request.as_ref());
        assert_eq!(blobs[0].param(OLD_DEVICE_ID_PARAM), Some("idA"));
        assert!(blobs[0].is_stamped_with("idB"));
        assert!(!blobs[0].requires_device_id);
        assert_eq!(blobs[1].id, pending.id);
        assert!(blobs[1].is_stamped_with("idA"));
        assert_eq!(m.current().id, "idB");
        assert_eq!(storage.get_state(DEVICE_ID_KEY).unwrap().as_deref(), Some("idB"));
    }

    #[test]
    fn merge_with_empty_ledger_appends_change() {
        let storage = Arc::new(MemoryStorage::new());
        let m = manager_with(storage.clone(), "idA");
        m.change_with_merge("idB", change_blob()).unwrap();
        let blobs = storage.list().unwrap();
        assert_eq!(blobs.len(), 1);
        assert!(blobs[0].is_identity_change());
    }

    #[test]
    fn non_merge_purges_old_blobs_only() {
        let storage = Arc::new(MemoryStorage::new());
        let m = manager_with(storage.clone(), "idA");
        let doomed = session_blob();
        m.append(doomed.clone(), 10).unwrap();
        let fixed = session_blob().with_fixed_device_id("idA");
        m.append(fixed.clone(), 10).unwrap();

        let report = m.change_without_merge("idB").unwrap();
        let purged: Vec<_> = report.purged.iter().map(|b| b.id.clone()).collect();
        assert_eq!(purged, vec![doomed.id]);
        assert_eq!(report.change_request, None);
        let blobs = storage.list().unwrap();
        assert_eq!(blobs, vec![fixed]);
        assert!(!storage.contains_identity_change().unwrap());
    }

    #[test]
    fn same_id_is_noop() {
        let m = manager_with(Arc::new(MemoryStorage::new()), "idA");
        assert!(m.change_without_merge("idA").unwrap().is_noop());
        assert!(m.change_with_merge("idA", change_blob()).unwrap().is_noop());
    }

    #[test]
    fn empty_id_rejected() {
        let m = manager_with(Arc::new(MemoryStorage::new()), "idA");
        assert!(matches!(m.change_without_merge(" "), Err(PipelineError::InvalidArgument(_))));
    }

    #[test]
    fn leaving_temporary_rewrites_stamps() {
        let storage = Arc::new(MemoryStorage::new());
        let m = IdentityManager::load_or_init(storage.clone(), None, true).unwrap();
        m.append(session_blob(), 10).unwrap();
        assert!(m.peek_sendable(&|_| true).unwrap().entry.is_none());

        let report = m.change_without_merge("real").unwrap();
        assert_eq!(report.rewritten, 1);
        assert!(report.purged.is_empty());
        let peek = m.peek_sendable(&|_| true).unwrap();
        assert!(peek.entry.unwrap().is_stamped_with("real"));
        assert_eq!(
            storage.get_state(DEVICE_ID_MODE_KEY).unwrap().as_deref(),
            Some("developer_supplied")
        );
    }

    #[test]
    fn entering_temporary_purges_and_stamps_sentinel() {
        let storage = Arc::new(MemoryStorage::new());
        let m = manager_with(storage.clone(), "idA");
        m.append(session_blob(), 10).unwrap();
        let report = m.change_without_merge(TEMPORARY_DEVICE_ID).unwrap();
        assert_eq!(report.purged.len(), 1);
        assert!(m.is_temporary());
        m.append(session_blob(), 10).unwrap();
        assert!(storage.list().unwrap()[0].is_stamped_with(TEMPORARY_DEVICE_ID));
    }

    #[test]
    fn rewrite_reports_undecodable_rows() {
        let sqlite = SqliteStorage::in_memory().unwrap();
        sqlite
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO requests (id, position, kind, created_at, payload) VALUES ('req_bad', 1, 'session', 0, '{not json')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        let storage: Arc<dyn Storage> = Arc::new(sqlite);
        let m = manager_with(storage.clone(), "idA");
        m.append(session_blob().with_fixed_device_id("idA"), 10).unwrap();

        let report = m.change_without_merge("idB").unwrap();
        assert_eq!(report.discarded, vec![RequestId::from_raw("req_bad")]);
        assert!(report.purged.is_empty());
        assert_eq!(storage.len().unwrap(), 1);
    }

    #[test]
    fn transition_commits_durably() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.db");
        {
            let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&path).unwrap());
            let m = manager_with(storage, "idA");
            m.append(session_blob(), 10).unwrap();
            m.change_with_merge("idB", change_blob()).unwrap();
        }
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&path).unwrap());
        let m = manager_with(storage.clone(), "ignored");
        assert_eq!(m.current(), DeviceIdentity::developer("idB"));
        let blobs = storage.list().unwrap();
        assert!(blobs[0].is_identity_change());
        assert!(blobs[1].is_stamped_with("idA"));
    }
}
