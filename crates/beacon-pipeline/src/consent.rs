use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use beacon_core::Feature;
use beacon_store::Storage;

use crate::error::Result;
use crate::health::HealthTracker;

pub const CONSENT_STATE_KEY: &str = "consent";

/// Answers whether a feature may record right now. When consent is not
/// required every feature is allowed and changes are ignored.
pub struct ConsentGate {
    required: bool,
    granted: RwLock<BTreeSet<Feature>>,
    storage: Arc<dyn Storage>,
    health: Arc<HealthTracker>,
}

impl ConsentGate {
    /// Persisted grants win over the configured initial grants.
    pub fn load(
        storage: Arc<dyn Storage>,
        health: Arc<HealthTracker>,
        required: bool,
        initial: &[Feature],
    ) -> Result<Self> {
        let granted = match storage.get_state(CONSENT_STATE_KEY)? {
            Some(raw) => match serde_json::from_str::<BTreeSet<Feature>>(&raw) {
                Ok(set) => set,
                Err(e) => {
                    warn!(error = %e, "unreadable consent state, using configured grants");
                    health.log_warning();
                    initial.iter().copied().collect()
                }
            },
            None => initial.iter().copied().collect(),
        };
        Ok(Self {
            required,
            granted: RwLock::new(granted),
            storage,
            health,
        })
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_allowed(&self, feature: Feature) -> bool {
        !self.required || self.granted.read().contains(&feature)
    }

    /// True when consent is not required or at least one feature is granted.
    pub fn any_given(&self) -> bool {
        !self.required || !self.granted.read().is_empty()
    }

    pub fn granted(&self) -> BTreeSet<Feature> {
        self.granted.read().clone()
    }

    /// Apply the requested grants and revocations and return only the ones
    /// that actually changed something.
    pub fn apply(&self, changes: &[(Feature, bool)]) -> Result<BTreeMap<Feature, bool>> {
        if !self.required {
            warn!("consent is not required, ignoring consent change");
            self.health.log_warning();
            return Ok(BTreeMap::new());
        }
        let mut granted = self.granted.write();
        let mut applied = BTreeMap::new();
        for &(feature, allow) in changes {
            let changed = if allow {
                granted.insert(feature)
            } else {
                granted.remove(&feature)
            };
            if changed {
                applied.insert(feature, allow);
            }
        }
        if !applied.is_empty() {
            self.storage
                .set_state(CONSENT_STATE_KEY, &serde_json::to_string(&*granted)?)?;
            debug!(?applied, "consent updated");
        }
        Ok(applied)
    }

    /// Revocations needed to withdraw everything currently granted.
    pub fn all_revocations(&self) -> Vec<(Feature, bool)> {
        self.granted.read().iter().map(|f| (*f, false)).collect()
    }
}
