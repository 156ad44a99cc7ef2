use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::BackoffConfig;

/// Whether the drainer may attempt a send right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffCheck {
    Ready,
    Wait {
        remaining: Duration,
        /// Attempts skipped in a row, including this one.
        skipped: u64,
    },
}

#[derive(Debug, Default)]
struct BackoffState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    next_eligible: Option<Instant>,
    skipped_in_a_row: u64,
    last_age_sweep: Option<Instant>,
}

/// Exponential backoff after consecutive transport failures. Lives for the
/// process; a restart starts eligible.
pub struct BackoffController {
    config: BackoffConfig,
    state: Mutex<BackoffState>,
}

impl BackoffController {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BackoffState::default()),
        }
    }

    /// Delay after `failures` consecutive failures, without jitter.
    /// Zero failures and one failure both give the base delay.
    pub fn compute_delay(&self, failures: u32) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let exp_delay = base * 2.0_f64.powi(exponent);
        let capped = exp_delay.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Record a failed send and return how long to hold off.
    pub fn record_failure(&self, now: Instant, suggested: Option<Duration>) -> Duration {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let delay = suggested.unwrap_or_else(|| self.with_jitter(self.compute_delay(state.consecutive_failures)));
        state.last_failure = Some(now);
        state.next_eligible = Some(now + delay);
        debug!(
            consecutive_failures = state.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "send failed, backing off"
        );
        delay
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.consecutive_failures > 0 {
            info!(
                after_failures = state.consecutive_failures,
                "collector reachable again, backoff reset"
            );
        }
        state.consecutive_failures = 0;
        state.next_eligible = None;
        state.skipped_in_a_row = 0;
    }

    pub fn check(&self, now: Instant) -> BackoffCheck {
        let mut state = self.state.lock();
        match state.next_eligible {
            Some(at) if now < at => {
                state.skipped_in_a_row += 1;
                BackoffCheck::Wait {
                    remaining: at - now,
                    skipped: state.skipped_in_a_row,
                }
            }
            _ => {
                state.skipped_in_a_row = 0;
                BackoffCheck::Ready
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Claim the whole-ledger age sweep. At most one claim succeeds per
    /// `interval`; the first claim always succeeds.
    pub fn claim_age_sweep(&self, now: Instant, interval: Duration) -> bool {
        let mut state = self.state.lock();
        match state.last_age_sweep {
            Some(last) if now.saturating_duration_since(last) < interval => false,
            _ => {
                state.last_age_sweep = Some(now);
                true
            }
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }
        let extra = delay.as_millis() as f64 * self.config.jitter_factor;
        let jitter = rand::thread_rng().gen_range(0.0..=extra);
        delay + Duration::from_millis(jitter as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackoffController {
        BackoffController::new(BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn delay_is_non_decreasing_and_capped() {
        let b = controller();
        let delays: Vec<_> = (0..10).map(|k| b.compute_delay(k)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[3], Duration::from_secs(4));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn huge_failure_counts_stay_capped() {
        let b = controller();
        assert_eq!(b.compute_delay(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_to_base() {
        let b = controller();
        let now = Instant::now();
        for _ in 0..4 {
            b.record_failure(now, None);
        }
        assert_eq!(b.consecutive_failures(), 4);
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.check(now), BackoffCheck::Ready);
        assert_eq!(b.record_failure(now, None), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn check_waits_until_eligible() {
        let b = controller();
        let now = Instant::now();
        b.record_failure(now, None);
        assert_eq!(
            b.check(now),
            BackoffCheck::Wait { remaining: Duration::from_secs(1), skipped: 1 }
        );
        assert!(matches!(b.check(now), BackoffCheck::Wait { skipped: 2, .. }));
        assert_eq!(b.check(now + Duration::from_secs(1)), BackoffCheck::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn server_suggested_delay_wins() {
        let b = controller();
        let d = b.record_failure(Instant::now(), Some(Duration::from_secs(42)));
        assert_eq!(d, Duration::from_secs(42));
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_only_adds() {
        let b = BackoffController::new(BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_factor: 0.5,
        });
        let d = b.record_failure(Instant::now(), None);
        assert!(d >= Duration::from_secs(1) && d <= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn age_sweep_claimed_once_per_interval() {
        let b = controller();
        let now = Instant::now();
        let interval = Duration::from_secs(60);
        assert!(b.claim_age_sweep(now, interval));
        assert!(!b.claim_age_sweep(now + Duration::from_secs(30), interval));
        assert!(b.claim_age_sweep(now + Duration::from_secs(60), interval));
    }
}
