//! Build mode: intake for large bursts of independently triggered evaluations (fill-down, paste, full recalc).
//!
//! While build mode is active, cache-missing evaluations are parked in an intake queue instead of going to the
//! registry one by one. When the intake window closes, the queue is grouped by merge key and every group is
//! admitted to the registry at once, so each group becomes exactly one pending query. The intake window is
//! rolling and bounded the same way the collection window is.

use crate::normalize::NormalizedQuery;
use crate::pending::ResultHandle;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// What a parked caller receives once its group has been admitted.
#[derive(Debug)]
pub enum Ticket {
    Cached(f64),
    Handle(ResultHandle),
}

#[derive(Debug)]
pub struct Queued {
    pub query: NormalizedQuery,
    pub reply: oneshot::Sender<Ticket>,
}

#[derive(Debug)]
pub enum Intake {
    /// Build mode is off; take the normal path.
    Bypass,
    /// Parked. `start_flusher` is set for exactly one caller per intake round.
    Parked {
        ticket:        oneshot::Receiver<Ticket>,
        start_flusher: bool,
    },
}

#[derive(Debug)]
pub enum FlushStep {
    Wait(Instant),
    Flush(Vec<Queued>),
}

#[derive(Debug, Default)]
struct BuildState {
    arrivals:      VecDeque<Instant>,
    forced:        bool,
    queue:         Vec<Queued>,
    deadline:      Option<Instant>,
    hard_deadline: Option<Instant>,
    flushing:      bool,
}

#[derive(Debug)]
pub struct BuildMode {
    window:    Duration,
    max_wait:  Duration,
    threshold: usize,
    detect:    Duration,
    state:     Mutex<BuildState>,
    wake:      Notify,
}

impl BuildMode {
    pub fn new(window: Duration, max_wait: Duration, threshold: usize, detect: Duration) -> Self {
        Self {
            window,
            max_wait: max_wait.max(window),
            threshold: threshold.max(1),
            detect,
            state: Mutex::new(BuildState::default()),
            wake: Notify::new(),
        }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.prune(&mut state, now);
        state.forced || !state.queue.is_empty() || state.arrivals.len() >= self.threshold
    }

    fn prune(&self, state: &mut BuildState, now: Instant) {
        while state
            .arrivals
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > self.detect)
        {
            state.arrivals.pop_front();
        }
    }

    pub fn force(&self, on: bool) {
        let mut state = self.state.lock();
        state.forced = on;
        if !on && !state.queue.is_empty() {
            // Leaving build mode flushes whatever was parked.
            state.deadline = Some(Instant::now());
            self.wake.notify_one();
        }
    }

    /// Register a cache-missing evaluation and park it if build mode is (or thereby becomes) active.
    pub fn offer(&self, query: &NormalizedQuery, now: Instant) -> Intake {
        let mut state = self.state.lock();
        state.arrivals.push_back(now);
        self.prune(&mut state, now);

        let active = state.forced || !state.queue.is_empty() || state.arrivals.len() >= self.threshold;
        if !active {
            return Intake::Bypass;
        }

        if state.queue.is_empty() {
            debug!(arrivals = state.arrivals.len(), "build mode intake opened");
            state.hard_deadline = Some(now + self.max_wait);
        }
        let hard = state.hard_deadline.unwrap_or(now + self.max_wait);
        state.deadline = Some((now + self.window).min(hard));

        let (reply, ticket) = oneshot::channel();
        state.queue.push(Queued {
            query: query.clone(),
            reply,
        });

        let start_flusher = !state.flushing;
        state.flushing = true;
        Intake::Parked { ticket, start_flusher }
    }

    /// Take the queue if the intake window is over.
    pub fn poll_flush(&self, now: Instant) -> FlushStep {
        let mut state = self.state.lock();
        match state.deadline {
            Some(deadline) if now < deadline && !state.queue.is_empty() => FlushStep::Wait(deadline),
            _ => {
                state.deadline = None;
                state.hard_deadline = None;
                state.flushing = false;
                FlushStep::Flush(std::mem::take(&mut state.queue))
            }
        }
    }

    /// Resolves when [`force(false)`](Self::force) asks for an early flush.
    pub async fn woken(&self) {
        self.wake.notified().await
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::normalize::EvalParams;

    fn q(entity: &str) -> NormalizedQuery {
        normalize(&EvalParams::new(entity, "Jan 2024")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn activates_on_burst() {
        let bm = BuildMode::new(Duration::from_millis(400), Duration::from_secs(3), 3, Duration::from_millis(250));
        let now = Instant::now();
        assert!(matches!(bm.offer(&q("1"), now), Intake::Bypass));
        assert!(matches!(bm.offer(&q("2"), now), Intake::Bypass));
        assert!(matches!(
            bm.offer(&q("3"), now),
            Intake::Parked {
                start_flusher: true,
                ..
            }
        ));
        assert!(matches!(
            bm.offer(&q("4"), now),
            Intake::Parked {
                start_flusher: false,
                ..
            }
        ));
        assert_eq!(bm.queued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_arrivals_never_activate() {
        let bm = BuildMode::new(Duration::from_millis(400), Duration::from_secs(3), 3, Duration::from_millis(250));
        let start = Instant::now();
        for i in 0..10u64 {
            let at = start + Duration::from_millis(200 * i);
            assert!(matches!(bm.offer(&q(&i.to_string()), at), Intake::Bypass));
        }
        assert!(!bm.is_active(start + Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn window_rolls_until_hard_deadline() {
        let bm = BuildMode::new(Duration::from_millis(400), Duration::from_secs(1), 1, Duration::from_millis(250));
        let start = Instant::now();
        bm.offer(&q("1"), start);
        assert!(matches!(bm.poll_flush(start), FlushStep::Wait(d) if d == start + Duration::from_millis(400)));

        bm.offer(&q("2"), start + Duration::from_millis(300));
        assert!(matches!(
            bm.poll_flush(start + Duration::from_millis(400)),
            FlushStep::Wait(d) if d == start + Duration::from_millis(700)
        ));

        bm.offer(&q("3"), start + Duration::from_millis(900));
        assert!(matches!(
            bm.poll_flush(start + Duration::from_millis(950)),
            FlushStep::Wait(d) if d == start + Duration::from_secs(1)
        ));

        let FlushStep::Flush(items) = bm.poll_flush(start + Duration::from_secs(1))
        else {
            panic!("intake must flush at the hard deadline");
        };
        assert_eq!(items.len(), 3);
        assert_eq!(bm.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_mode_parks_everything() {
        let bm = BuildMode::new(Duration::from_millis(400), Duration::from_secs(3), 100, Duration::from_millis(250));
        bm.force(true);
        assert!(bm.is_active(Instant::now()));
        assert!(matches!(bm.offer(&q("1"), Instant::now()), Intake::Parked { .. }));
        bm.force(false);
        assert!(matches!(bm.poll_flush(Instant::now()), FlushStep::Flush(items) if items.len() == 1));
        assert!(!bm.is_active(Instant::now() + Duration::from_secs(1)));
    }
}
