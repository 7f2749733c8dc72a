use std::time::Duration;
use tracing::trace;

/// Polls for a value that is expected to show up shortly, on a fixed schedule with a hard ceiling.
///
/// Running out of attempts is not an error: the caller goes back to the normal evaluation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedWait {
    interval: Duration,
    attempts: u32,
}

impl BoundedWait {
    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Upper bound of the time [`poll`](Self::poll) can take.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.attempts
    }

    /// Call `check` after each interval until it yields a value or the attempts are used up.
    pub async fn poll<F>(&self, mut check: F) -> Option<f64>
    where
        F: FnMut() -> Option<f64>,
    {
        for attempt in 1..=self.attempts {
            tokio::time::sleep(self.interval).await;
            if let Some(value) = check() {
                trace!(attempt, "awaited value is available");
                return Some(value);
            }
        }
        trace!(attempts = self.attempts, "bounded wait exhausted");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn returns_on_first_hit() {
        let wait = BoundedWait::new(Duration::from_millis(250), 10);
        let start = Instant::now();
        let mut checks = 0;
        let value = wait
            .poll(|| {
                checks += 1;
                (checks == 3).then_some(0.0)
            })
            .await;
        assert_eq!(value, Some(0.0));
        assert_eq!(start.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_ceiling() {
        let wait = BoundedWait::new(Duration::from_millis(300), 4);
        let start = Instant::now();
        assert_eq!(wait.poll(|| None).await, None);
        assert_eq!(start.elapsed(), wait.ceiling());
    }
}
