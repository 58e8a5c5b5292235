//! Daily provider quota and circuit-breaker state.
//!
//! `QuotaGuard` owns the process-wide counters behind a single mutex. Every
//! provider round trip must first obtain a slot with
//! [`QuotaGuard::try_reserve`]; the slot is counted whether the call succeeds
//! or not.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use time::Date;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Provider round trips allowed per calendar day.
    pub daily_limit: u64,
    /// Usage level that starts logging warnings.
    pub warning_threshold: u64,
    /// Usage level that trips forced fallback for the rest of the day.
    pub emergency_threshold: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 2400,
            warning_threshold: 2000,
            emergency_threshold: 2300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaStatus {
    Normal,
    WarningThreshold,
    DailyLimitReached,
    EmergencyFallback,
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    ForcedFallback,
    EmergencyThreshold,
    DailyLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchWarning {
    ApproachingEmergencyThreshold,
}

/// Outcome of a dry-run check for an expected number of calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheck {
    pub allowed: bool,
    pub warning: Option<BatchWarning>,
    pub current_calls: u64,
    pub expected_calls: u64,
    pub projected_total: u64,
    pub daily_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub calls_today: u64,
    pub daily_limit: u64,
    pub remaining_calls: u64,
    pub consecutive_failures: u32,
    pub forced_fallback: bool,
    pub status: QuotaStatus,
    pub day: Date,
}

impl QuotaSnapshot {
    /// Share of the daily limit used, in percent (one decimal).
    pub fn usage_percentage(&self) -> f64 {
        if self.daily_limit == 0 {
            return 100.0;
        }
        crate::model::round_to(self.calls_today as f64 / self.daily_limit as f64 * 100.0, 1)
    }
}

#[derive(Debug)]
struct QuotaState {
    calls_today: u64,
    consecutive_failures: u32,
    forced_fallback: bool,
    day: Date,
}

impl QuotaState {
    fn roll_over(&mut self, today: Date) {
        if today != self.day {
            info!(previous = %self.day, %today, calls = self.calls_today, "new day, resetting provider quota");
            self.calls_today = 0;
            self.consecutive_failures = 0;
            self.forced_fallback = false;
            self.day = today;
        }
    }
}

#[derive(Debug)]
pub struct QuotaGuard {
    config: QuotaConfig,
    failure_threshold: u32,
    state: Mutex<QuotaState>,
}

impl QuotaGuard {
    pub fn new(config: QuotaConfig, failure_threshold: u32, today: Date) -> Self {
        Self {
            config,
            failure_threshold,
            state: Mutex::new(QuotaState {
                calls_today: 0,
                consecutive_failures: 0,
                forced_fallback: false,
                day: today,
            }),
        }
    }

    fn lock(&self, today: Date) -> MutexGuard<'_, QuotaState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.roll_over(today);
        state
    }

    /// Claim one provider call for `today`.
    pub fn try_reserve(&self, today: Date) -> Result<u64, Denial> {
        self.reserve(today, false)
    }

    /// Claim a call for a health probe, which may run while fallback is forced.
    pub fn try_reserve_probe(&self, today: Date) -> Result<u64, Denial> {
        self.reserve(today, true)
    }

    fn reserve(&self, today: Date, probe: bool) -> Result<u64, Denial> {
        let mut state = self.lock(today);
        if state.forced_fallback && !probe {
            return Err(Denial::ForcedFallback);
        }
        let next = state.calls_today + 1;
        if next > self.config.emergency_threshold && !probe {
            warn!(
                calls_today = state.calls_today,
                emergency_threshold = self.config.emergency_threshold,
                "emergency threshold reached, forcing fallback for the rest of the day"
            );
            state.forced_fallback = true;
            return Err(Denial::EmergencyThreshold);
        }
        if next > self.config.daily_limit {
            return Err(Denial::DailyLimit);
        }
        state.calls_today = next;
        if next >= self.config.warning_threshold {
            warn!(
                calls_today = next,
                daily_limit = self.config.daily_limit,
                "provider usage above warning threshold"
            );
        }
        Ok(next)
    }

    /// Dry run for `expected` calls; never changes counters.
    pub fn check_batch(&self, expected: u64, today: Date) -> BatchCheck {
        let state = self.lock(today);
        let projected_total = state.calls_today + expected;
        let allowed = !state.forced_fallback && projected_total <= self.config.daily_limit;
        let warning = (allowed && projected_total > self.config.emergency_threshold)
            .then_some(BatchWarning::ApproachingEmergencyThreshold);
        if !allowed {
            warn!(
                current = state.calls_today,
                expected,
                projected_total,
                daily_limit = self.config.daily_limit,
                "batch pre-check refused"
            );
        }
        BatchCheck {
            allowed,
            warning,
            current_calls: state.calls_today,
            expected_calls: expected,
            projected_total,
            daily_limit: self.config.daily_limit,
        }
    }

    pub fn record_success(&self, today: Date) {
        self.lock(today).consecutive_failures = 0;
    }

    /// Count a failed call; returns true when this failure tripped the breaker.
    pub fn record_failure(&self, today: Date) -> bool {
        let mut state = self.lock(today);
        state.consecutive_failures += 1;
        if !state.forced_fallback && state.consecutive_failures >= self.failure_threshold {
            state.forced_fallback = true;
            return true;
        }
        false
    }

    /// Re-enable the provider after a successful health probe.
    pub fn clear_fallback(&self, today: Date) {
        let mut state = self.lock(today);
        state.forced_fallback = false;
        state.consecutive_failures = 0;
    }

    pub fn is_forced_fallback(&self, today: Date) -> bool {
        self.lock(today).forced_fallback
    }

    /// Zero every counter immediately.
    pub fn reset(&self, today: Date) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = QuotaState {
            calls_today: 0,
            consecutive_failures: 0,
            forced_fallback: false,
            day: today,
        };
    }

    pub fn snapshot(&self, today: Date) -> QuotaSnapshot {
        let state = self.lock(today);
        let status = if state.forced_fallback {
            QuotaStatus::EmergencyFallback
        } else if state.calls_today >= self.config.daily_limit {
            QuotaStatus::DailyLimitReached
        } else if state.calls_today >= self.config.warning_threshold {
            QuotaStatus::WarningThreshold
        } else {
            QuotaStatus::Normal
        };
        QuotaSnapshot {
            calls_today: state.calls_today,
            daily_limit: self.config.daily_limit,
            remaining_calls: self.config.daily_limit.saturating_sub(state.calls_today),
            consecutive_failures: state.consecutive_failures,
            forced_fallback: state.forced_fallback,
            status,
            day: state.day,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use time::macros::date;

    use super::*;

    fn guard(daily_limit: u64, emergency_threshold: u64) -> QuotaGuard {
        QuotaGuard::new(
            QuotaConfig {
                daily_limit,
                warning_threshold: daily_limit,
                emergency_threshold,
            },
            3,
            date!(2026 - 10 - 19),
        )
    }

    #[test]
    fn daily_limit_refuses_without_forcing_fallback() {
        let quota = guard(5, 100);
        let today = date!(2026 - 10 - 19);
        for expected in 1..=5 {
            assert_eq!(quota.try_reserve(today), Ok(expected));
        }
        assert_eq!(quota.try_reserve(today), Err(Denial::DailyLimit));
        let snapshot = quota.snapshot(today);
        assert_eq!(snapshot.calls_today, 5);
        assert_eq!(snapshot.remaining_calls, 0);
        assert!(!snapshot.forced_fallback);
        assert_eq!(snapshot.status, QuotaStatus::DailyLimitReached);
    }

    #[test]
    fn emergency_threshold_forces_fallback() {
        let quota = guard(10, 2);
        let today = date!(2026 - 10 - 19);
        assert!(quota.try_reserve(today).is_ok());
        assert!(quota.try_reserve(today).is_ok());
        assert_eq!(quota.try_reserve(today), Err(Denial::EmergencyThreshold));
        assert_eq!(quota.try_reserve(today), Err(Denial::ForcedFallback));
        assert_eq!(quota.snapshot(today).status, QuotaStatus::EmergencyFallback);
    }

    #[test]
    fn consecutive_failures_trip_breaker_once() {
        let quota = guard(100, 100);
        let today = date!(2026 - 10 - 19);
        assert!(!quota.record_failure(today));
        assert!(!quota.record_failure(today));
        assert!(quota.record_failure(today));
        assert!(!quota.record_failure(today));
        assert!(quota.is_forced_fallback(today));
    }

    #[test]
    fn success_resets_failure_streak() {
        let quota = guard(100, 100);
        let today = date!(2026 - 10 - 19);
        quota.record_failure(today);
        quota.record_failure(today);
        quota.record_success(today);
        assert!(!quota.record_failure(today));
        assert_eq!(quota.snapshot(today).consecutive_failures, 1);
    }

    #[test]
    fn new_day_resets_everything() {
        let quota = guard(2, 2);
        let today = date!(2026 - 10 - 19);
        let tomorrow = date!(2026 - 10 - 20);
        quota.try_reserve(today).ok();
        quota.try_reserve(today).ok();
        quota.try_reserve(today).ok();
        assert!(quota.is_forced_fallback(today));

        assert!(!quota.is_forced_fallback(tomorrow));
        let snapshot = quota.snapshot(tomorrow);
        assert_eq!(snapshot.calls_today, 0);
        assert_eq!(snapshot.day, tomorrow);
        assert_eq!(quota.try_reserve(tomorrow), Ok(1));
    }

    #[rstest]
    #[case(0, 5, true, None)]
    #[case(0, 10, true, Some(BatchWarning::ApproachingEmergencyThreshold))]
    #[case(3, 8, false, None)]
    fn batch_check_projects_usage(
        #[case] already: u64,
        #[case] expected: u64,
        #[case] allowed: bool,
        #[case] warning: Option<BatchWarning>,
    ) {
        let quota = guard(10, 8);
        let today = date!(2026 - 10 - 19);
        for _ in 0..already {
            quota.try_reserve(today).ok();
        }
        let check = quota.check_batch(expected, today);
        assert_eq!(check.allowed, allowed);
        assert_eq!(check.warning, warning);
        assert_eq!(check.projected_total, already + expected);
        assert_eq!(quota.snapshot(today).calls_today, already);
    }

    #[test]
    fn manual_reset_clears_fallback() {
        let quota = guard(100, 100);
        let today = date!(2026 - 10 - 19);
        for _ in 0..3 {
            quota.record_failure(today);
        }
        quota.reset(today);
        assert!(!quota.is_forced_fallback(today));
        assert_eq!(quota.try_reserve(today), Ok(1));
    }

    #[test]
    fn usage_percentage_one_decimal() {
        let quota = guard(3, 100);
        let today = date!(2026 - 10 - 19);
        quota.try_reserve(today).ok();
        assert_eq!(quota.snapshot(today).usage_percentage(), 33.3);
    }
}
