//! Self-instrumentation counters reported to the collector as `hc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use beacon_store::Storage;

use crate::outcome::DropReason;

pub const HEALTH_STATE_KEY: &str = "health";
const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCounters {
    pub warnings: u64,
    pub errors: u64,
    /// Status of the last failed request, -1 if none.
    pub status_code: i32,
    pub error_message: String,
    /// Failed requests per status code; transport failures without a
    /// status are counted under 0.
    pub failed_by_status: BTreeMap<u16, u64>,
    pub backoff_requests: u64,
    pub consecutive_backoff_max: u64,
    pub sessions_started_while_running: u64,
    pub sessions_updated_while_not_running: u64,
    pub sessions_ended_while_not_running: u64,
    pub events_evicted: u64,
    pub dropped: BTreeMap<DropReason, u64>,
}

impl Default for HealthCounters {
    fn default() -> Self {
        Self {
            warnings: 0,
            errors: 0,
            status_code: -1,
            error_message: String::new(),
            failed_by_status: BTreeMap::new(),
            backoff_requests: 0,
            consecutive_backoff_max: 0,
            sessions_started_while_running: 0,
            sessions_updated_while_not_running: 0,
            sessions_ended_while_not_running: 0,
            events_evicted: 0,
            dropped: BTreeMap::new(),
        }
    }
}

/// Counter set shared by every component. One lock guards both the counters
/// and their persistence so a saved snapshot is never torn.
pub struct HealthTracker {
    counters: Mutex<HealthCounters>,
    storage: Arc<dyn Storage>,
}

impl HealthTracker {
    /// Load persisted counters. Unreadable state is reset and saved.
    pub fn load(storage: Arc<dyn Storage>) -> Self {
        let tracker = Self {
            counters: Mutex::new(HealthCounters::default()),
            storage,
        };
        match tracker.storage.get_state(HEALTH_STATE_KEY) {
            Ok(Some(raw)) if !raw.is_empty() => match serde_json::from_str::<HealthCounters>(&raw) {
                Ok(counters) => {
                    debug!(?counters, "loaded health counters");
                    *tracker.counters.lock() = counters;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read health state, resetting");
                    tracker.clear_and_save();
                }
            },
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to load health state"),
        }
        tracker
    }

    pub fn log_warning(&self) {
        self.counters.lock().warnings += 1;
    }

    pub fn log_error(&self) {
        self.counters.lock().errors += 1;
    }

    pub fn log_failed_network_request(&self, status: Option<u16>, body: &str) {
        self.mutate(|c| {
            if let Some(status) = status {
                c.status_code = i32::from(status);
            }
            c.error_message = body.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
            *c.failed_by_status.entry(status.unwrap_or(0)).or_default() += 1;
        });
    }

    pub fn log_session_started_while_running(&self) {
        self.mutate(|c| c.sessions_started_while_running += 1);
    }

    pub fn log_session_ended_while_not_running(&self) {
        self.mutate(|c| c.sessions_ended_while_not_running += 1);
    }

    pub fn log_session_updated_while_not_running(&self) {
        self.mutate(|c| c.sessions_updated_while_not_running += 1);
    }

    pub fn log_backoff_request(&self) {
        self.counters.lock().backoff_requests += 1;
    }

    /// Keeps the longest run of consecutive backed-off attempts.
    pub fn log_consecutive_backoff_request(&self, consecutive: u64) {
        let mut c = self.counters.lock();
        c.consecutive_backoff_max = c.consecutive_backoff_max.max(consecutive);
    }

    pub fn log_events_evicted(&self, count: usize) {
        if count > 0 {
            self.mutate(|c| c.events_evicted += count as u64);
        }
    }

    pub fn log_dropped(&self, reason: DropReason, count: usize) {
        if count > 0 {
            self.mutate(|c| *c.dropped.entry(reason).or_default() += count as u64);
        }
    }

    pub fn dropped_count(&self, reason: DropReason) -> u64 {
        self.counters.lock().dropped.get(&reason).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HealthCounters {
        self.counters.lock().clone()
    }

    /// Reset after the collector confirmed a health report.
    pub fn clear_and_save(&self) {
        let mut c = self.counters.lock();
        *c = HealthCounters::default();
        if let Err(e) = self.storage.remove_state(HEALTH_STATE_KEY) {
            warn!(error = %e, "failed to clear health state");
        }
    }

    /// Persist without resetting.
    pub fn save_state(&self) {
        let c = self.counters.lock();
        self.persist(&c);
    }

    /// `hc` parameter value.
    pub fn hc_json(&self) -> String {
        let c = self.counters.lock();
        let dropped: BTreeMap<&str, u64> = c.dropped.iter().map(|(r, n)| (r.as_str(), *n)).collect();
        let failed: BTreeMap<String, u64> = c
            .failed_by_status
            .iter()
            .map(|(s, n)| (s.to_string(), *n))
            .collect();
        json!({
            "el": c.errors,
            "wl": c.warnings,
            "sc": c.status_code,
            "em": c.error_message,
            "bom": c.backoff_requests,
            "cbom": c.consecutive_backoff_max,
            "ssr": c.sessions_started_while_running,
            "sur": c.sessions_updated_while_not_running,
            "ser": c.sessions_ended_while_not_running,
            "ee": c.events_evicted,
            "dr": dropped,
            "fr": failed,
        })
        .to_string()
    }

    fn mutate(&self, f: impl FnOnce(&mut HealthCounters)) {
        let mut c = self.counters.lock();
        f(&mut c);
        self.persist(&c);
    }

    fn persist(&self, c: &HealthCounters) {
        let result = serde_json::to_string(c)
            .map_err(beacon_store::StoreError::from)
            .and_then(|raw| self.storage.set_state(HEALTH_STATE_KEY, &raw));
        if let Err(e) = result {
            warn!(error = %e, "failed to save health state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_store::{MemoryStorage, StateStore};

    fn tracker() -> (Arc<MemoryStorage>, HealthTracker) {
        let storage = Arc::new(MemoryStorage::new());
        let t = HealthTracker::load(storage.clone());
        (storage, t)
    }

    #[test]
    fn fresh_counters_report_no_status() {
        let (_, t) = tracker();
        let hc: serde_json::Value = serde_json::from_str(&t.hc_json()).unwrap();
        assert_eq!(hc["sc"], -1);
        assert_eq!(hc["el"], 0);
        assert_eq!(hc["em"], "");
    }

    #[test]
    fn failed_request_caps_message_and_counts_status() {
        let (_, t) = tracker();
        t.log_failed_network_request(Some(500), &"x".repeat(1500));
        t.log_failed_network_request(Some(500), "again");
        t.log_failed_network_request(None, "offline");
        let c = t.snapshot();
        assert_eq!(c.status_code, 500);
        assert_eq!(c.error_message, "offline");
        assert_eq!(c.failed_by_status.get(&500), Some(&2));
        assert_eq!(c.failed_by_status.get(&0), Some(&1));

        t.log_failed_network_request(Some(502), &"y".repeat(1500));
        assert_eq!(t.snapshot().error_message.chars().count(), 1000);
    }

    #[test]
    fn consecutive_backoff_keeps_maximum() {
        let (_, t) = tracker();
        t.log_consecutive_backoff_request(3);
        t.log_consecutive_backoff_request(1);
        assert_eq!(t.snapshot().consecutive_backoff_max, 3);
    }

    #[test]
    fn counters_survive_reload() {
        let (storage, t) = tracker();
        t.log_warning();
        t.log_dropped(DropReason::IdentityPurged, 2);
        t.save_state();
        let reloaded = HealthTracker::load(storage);
        assert_eq!(reloaded.snapshot().warnings, 1);
        assert_eq!(reloaded.dropped_count(DropReason::IdentityPurged), 2);
    }

    #[test]
    fn clear_and_save_resets_storage() {
        let (storage, t) = tracker();
        t.log_events_evicted(4);
        t.clear_and_save();
        assert_eq!(t.snapshot(), HealthCounters::default());
        assert_eq!(storage.get_state(HEALTH_STATE_KEY).unwrap(), None);
    }

    #[test]
    fn corrupt_state_is_reset() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_state(HEALTH_STATE_KEY, "{not json").unwrap();
        let t = HealthTracker::load(storage.clone());
        assert_eq!(t.snapshot(), HealthCounters::default());
        assert_eq!(storage.get_state(HEALTH_STATE_KEY).unwrap(), None);
    }

    #[test]
    fn hc_payload_names_drop_reasons() {
        let (_, t) = tracker();
        t.log_dropped(DropReason::TooOld, 1);
        t.log_session_started_while_running();
        let hc: serde_json::Value = serde_json::from_str(&t.hc_json()).unwrap();
        assert_eq!(hc["dr"]["too_old"], 1);
        assert_eq!(hc["ssr"], 1);
    }
}
