//! Search cost circuit breaker.
//!
//! Web search spend is metered per wall-clock minute. A tripped breaker is a
//! transient condition: the steward surfaces it with a `retry_after` hint and
//! the worker backs the task off instead of failing it.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use super::worker::registry::StewardError;

#[derive(Debug, Error)]
#[error("search budget exceeded, retry after {retry_after:?}")]
pub struct BudgetExceeded {
    pub retry_after: Duration,
}

impl From<BudgetExceeded> for StewardError {
    fn from(exceeded: BudgetExceeded) -> Self {
        let retry_after = exceeded.retry_after;
        StewardError::transient_after(exceeded, retry_after)
    }
}

pub struct SearchBudget {
    per_minute_limit: u32,
    state: Mutex<WindowState>,
}

#[derive(Default)]
struct WindowState {
    minute: i64,
    spent: u32,
}

impl SearchBudget {
    pub fn new(per_minute_limit: u32) -> Self {
        Self {
            per_minute_limit,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// No metering; development and tests.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Reserve one search in the current minute window.
    pub fn try_spend(&self) -> Result<(), BudgetExceeded> {
        if self.per_minute_limit == 0 {
            return Ok(());
        }

        let now = Utc::now().timestamp();
        let minute = now / 60;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.minute != minute {
            state.minute = minute;
            state.spent = 0;
        }
        if state.spent >= self.per_minute_limit {
            return Err(BudgetExceeded {
                retry_after: Duration::from_secs((60 - now % 60) as u64),
            });
        }
        state.spent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_trips() {
        let budget = SearchBudget::unlimited();
        for _ in 0..1_000 {
            budget.try_spend().unwrap();
        }
    }

    #[test]
    fn trips_at_the_limit_with_a_retry_hint() {
        let budget = SearchBudget::new(2);
        budget.try_spend().unwrap();
        budget.try_spend().unwrap();

        let exceeded = budget.try_spend().unwrap_err();
        assert!(exceeded.retry_after <= Duration::from_secs(60));
        assert!(exceeded.retry_after > Duration::ZERO);
    }

    #[test]
    fn exceeded_maps_to_transient_steward_error() {
        let budget = SearchBudget::new(1);
        budget.try_spend().unwrap();
        let error: StewardError = budget.try_spend().unwrap_err().into();
        assert!(matches!(
            error,
            StewardError::Transient {
                retry_after: Some(_),
                ..
            }
        ));
    }
}
