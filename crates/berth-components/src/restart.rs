//! Restart policy and crash-loop guard.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use berth_config::{BackoffSection, BackoffStrategy, EffectivePolicy, RestartSection};
use serde::{Deserialize, Serialize};

/// What happens when a component crashes or loses its last reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    /// Restart after an unexpected exit.
    pub restart_on_crash: bool,
    /// Stop once the reference count reaches zero.
    pub shutdown_on_idle: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            restart_on_crash: true,
            shutdown_on_idle: true,
        }
    }
}

impl From<EffectivePolicy> for RestartPolicy {
    fn from(policy: EffectivePolicy) -> Self {
        Self {
            restart_on_crash: policy.restart_on_crash,
            shutdown_on_idle: policy.shutdown_on_idle,
        }
    }
}

/// Delay schedule between automatic restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    strategy: BackoffStrategy,
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Build from the `[restart.backoff]` section.
    #[must_use]
    pub fn from_section(section: &BackoffSection) -> Self {
        Self {
            strategy: section.strategy,
            initial: Duration::from_millis(section.initial_delay_ms),
            max: Duration::from_millis(section.max_delay_ms),
            multiplier: section.multiplier,
        }
    }

    /// A schedule that never waits.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before restart number `attempt` (1-based). Attempt 0 is immediate.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.initial,
            BackoffStrategy::Linear => self.initial.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
                let capped = ms.min(self.max.as_millis() as f64).max(0.0);
                Duration::from_millis(capped as u64)
            },
        };
        delay.min(self.max)
    }
}

/// Crash-loop guard settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CrashLoopGuard {
    /// Crashes tolerated inside `window`.
    pub max_restarts: u32,
    /// Sliding window over which crashes are counted.
    pub window: Duration,
    /// A run at least this long forgets earlier crashes.
    pub min_uptime: Duration,
    /// Delay schedule.
    pub backoff: Backoff,
}

impl CrashLoopGuard {
    /// Build from the `[restart]` section.
    #[must_use]
    pub fn from_section(section: &RestartSection) -> Self {
        Self {
            max_restarts: section.max_restarts,
            window: Duration::from_secs(section.restart_window_secs),
            min_uptime: Duration::from_secs(section.min_uptime_secs),
            backoff: Backoff::from_section(&section.backoff),
        }
    }
}

impl Default for CrashLoopGuard {
    fn default() -> Self {
        Self::from_section(&RestartSection::default())
    }
}

/// Outcome of [`RestartTracker::on_crash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after waiting this long.
    RestartAfter(Duration),
    /// Too many crashes in the window; leave the component stopped.
    GiveUp {
        /// Crashes counted inside the window.
        crashes: u32,
    },
}

/// Per-instance crash history.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    guard: CrashLoopGuard,
    crashes: VecDeque<Instant>,
}

impl RestartTracker {
    /// A tracker with no recorded crashes.
    #[must_use]
    pub fn new(guard: CrashLoopGuard) -> Self {
        Self {
            guard,
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash after `uptime` of running and decide what to do.
    pub fn on_crash(&mut self, uptime: Duration, now: Instant) -> RestartDecision {
        if uptime >= self.guard.min_uptime {
            self.crashes.clear();
        }
        while let Some(oldest) = self.crashes.front() {
            if now.saturating_duration_since(*oldest) > self.guard.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);

        let crashes = u32::try_from(self.crashes.len()).unwrap_or(u32::MAX);
        if crashes > self.guard.max_restarts {
            RestartDecision::GiveUp { crashes }
        } else {
            RestartDecision::RestartAfter(self.guard.backoff.delay_for_attempt(crashes))
        }
    }

    /// Crashes currently inside the window.
    #[must_use]
    pub fn recent_crashes(&self) -> usize {
        self.crashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential() -> Backoff {
        Backoff::from_section(&BackoffSection {
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        })
    }

    #[test]
    fn default_policy_restarts_and_idles_out() {
        let policy = RestartPolicy::default();
        assert!(policy.restart_on_crash);
        assert!(policy.shutdown_on_idle);
    }

    #[test]
    fn exponential_delays_are_capped() {
        let backoff = exponential();
        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn linear_and_fixed() {
        let mut section = BackoffSection {
            strategy: BackoffStrategy::Linear,
            initial_delay_ms: 100,
            max_delay_ms: 250,
            multiplier: 2.0,
        };
        let linear = Backoff::from_section(&section);
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(250));

        section.strategy = BackoffStrategy::Fixed;
        let fixed = Backoff::from_section(&section);
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_millis(100));
    }

    #[test]
    fn breaker_trips_after_max_restarts() {
        let mut tracker = RestartTracker::new(CrashLoopGuard {
            max_restarts: 2,
            window: Duration::from_secs(60),
            min_uptime: Duration::from_secs(2),
            backoff: Backoff::immediate(),
        });
        let now = Instant::now();
        let short = Duration::from_millis(10);
        assert!(matches!(tracker.on_crash(short, now), RestartDecision::RestartAfter(_)));
        assert!(matches!(tracker.on_crash(short, now), RestartDecision::RestartAfter(_)));
        assert_eq!(tracker.on_crash(short, now), RestartDecision::GiveUp { crashes: 3 });
    }

    #[test]
    fn long_uptime_resets_count() {
        let mut tracker = RestartTracker::new(CrashLoopGuard {
            max_restarts: 1,
            window: Duration::from_secs(60),
            min_uptime: Duration::from_secs(2),
            backoff: Backoff::immediate(),
        });
        let now = Instant::now();
        tracker.on_crash(Duration::ZERO, now);
        let decision = tracker.on_crash(Duration::from_secs(30), now);
        assert!(matches!(decision, RestartDecision::RestartAfter(_)));
        assert_eq!(tracker.recent_crashes(), 1);
    }

    #[test]
    fn crashes_outside_window_are_forgotten() {
        let mut tracker = RestartTracker::new(CrashLoopGuard {
            max_restarts: 1,
            window: Duration::from_secs(10),
            min_uptime: Duration::from_secs(2),
            backoff: Backoff::immediate(),
        });
        let start = Instant::now();
        tracker.on_crash(Duration::ZERO, start);
        let later = start.checked_add(Duration::from_secs(11)).unwrap();
        assert!(matches!(
            tracker.on_crash(Duration::ZERO, later),
            RestartDecision::RestartAfter(_)
        ));
    }
}
