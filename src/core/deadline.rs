use std::time::Duration;

use tokio::time::Instant;

/// A single wall-clock deadline computed when a run starts.
///
/// Every step of a run asks the same `Deadline` for its remaining budget
/// instead of recomputing elapsed time on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn budget_ms(&self) -> u64 {
        u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX)
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() { None } else { Some(left) }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// Sleeps for `interval`, clamped to the remaining budget.
    ///
    /// Returns `false` without sleeping when the deadline has already passed.
    pub async fn sleep_within(&self, interval: Duration) -> bool {
        match self.remaining() {
            Some(left) => {
                tokio::time::sleep(interval.min(left)).await;
                true
            }
            None => false,
        }
    }
}

/// Resolves once `deadline` has passed. Never resolves without one.
pub async fn expired(deadline: Option<Deadline>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.instant()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_shrinks_and_expires() {
        let deadline = Deadline::after(Duration::from_millis(1000));
        assert_eq!(deadline.remaining(), Some(Duration::from_millis(1000)));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(deadline.remaining(), Some(Duration::from_millis(600)));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(deadline.remaining(), None);
        assert!(deadline.is_expired());
        assert_eq!(deadline.budget_ms(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_clamped_to_budget() {
        let deadline = Deadline::after(Duration::from_millis(300));
        let start = Instant::now();

        assert!(deadline.sleep_within(Duration::from_millis(800)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert!(!deadline.sleep_within(Duration::from_millis(800)).await);
    }
}
