//! Pending request registry and result handles.
//!
//! Every operation in here is synchronous. The registry map and each pending query's mutable state are guarded
//! by `parking_lot` mutexes that are never held across an `.await`, which makes check-and-register and the
//! `Collecting -> Dispatched` flip atomic even on a multi-threaded runtime. Lock order is always registry first,
//! then the pending query.

use crate::error::CoalesceError;
use crate::normalize::Entity;
use crate::normalize::FilterSet;
use crate::normalize::MergeKey;
use crate::normalize::NormalizedQuery;
use crate::normalize::QuerySignature;
use crate::period::Period;
use crate::types::BatchValues;
use crate::types::RemoteRequest;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

pub type Outcome = Result<Arc<BatchValues>, CoalesceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Collecting,
    Dispatched,
}

/// Shared outcome of one pending query. Every clone observes the same settlement, including clones taken after
/// the query was dispatched.
#[derive(Debug, Clone)]
pub struct ResultHandle {
    id: u64,
    rx: watch::Receiver<Option<Outcome>>,
}

impl ResultHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for settlement. A query dropped without settling yields [`CoalesceError::Abandoned`].
    pub async fn wait(mut self) -> Outcome {
        match self.rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(CoalesceError::Abandoned(self.id))),
            Err(_) => Err(CoalesceError::Abandoned(self.id)),
        }
    }
}

#[derive(Debug)]
struct PendingInner {
    state:         PendingState,
    entities:      BTreeSet<Entity>,
    periods:       BTreeSet<Period>,
    needs:         HashMap<QuerySignature, NormalizedQuery>,
    deadline:      Instant,
    hard_deadline: Instant,
    merges:        usize,
}

/// The coordination record of one in-flight logical query.
pub struct PendingQuery {
    id:        u64,
    merge_key: MergeKey,
    filters:   FilterSet,
    tx:        watch::Sender<Option<Outcome>>,
    inner:     Mutex<PendingInner>,
}

/// What a dispatched pending query hands to the batch executor.
#[derive(Debug, Clone)]
pub struct DispatchedBatch {
    pub request: RemoteRequest,
    pub needs:   Vec<NormalizedQuery>,
    pub merges:  usize,
}

#[derive(Debug)]
pub enum DispatchStep {
    /// Still collecting; check again at this instant.
    Wait(Instant),
    /// Flipped to dispatched; issue the remote call now.
    Dispatch(DispatchedBatch),
    /// Already dispatched or detached by a cache clear.
    Gone,
}

enum Coverage {
    Full,
    Pattern,
    None,
}

impl PendingQuery {
    fn new(id: u64, query: &NormalizedQuery, now: Instant, delay: Duration, max_wait: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        let mut inner = PendingInner {
            state:         PendingState::Collecting,
            entities:      BTreeSet::new(),
            periods:       BTreeSet::new(),
            needs:         HashMap::new(),
            deadline:      now + delay,
            hard_deadline: now + max_wait.max(delay),
            merges:        0,
        };
        Self::absorb(&mut inner, query);
        Self {
            id,
            merge_key: query.merge_key(),
            filters: query.filters().clone(),
            tx,
            inner: Mutex::new(inner),
        }
    }

    fn absorb(inner: &mut PendingInner, query: &NormalizedQuery) {
        inner.entities.extend(query.entities().iter().cloned());
        inner.periods.extend(query.months());
        inner
            .needs
            .entry(query.signature().clone())
            .or_insert_with(|| query.clone());
        inner.merges += 1;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn merge_key(&self) -> &MergeKey {
        &self.merge_key
    }

    pub fn state(&self) -> PendingState {
        self.inner.lock().state
    }

    pub fn handle(&self) -> ResultHandle {
        ResultHandle {
            id: self.id,
            rx: self.tx.subscribe(),
        }
    }

    /// Accumulated entities and months, for inspection.
    pub fn accumulated(&self) -> (Vec<Entity>, Vec<Period>) {
        let inner = self.inner.lock();
        (
            inner.entities.iter().cloned().collect(),
            inner.periods.iter().copied().collect(),
        )
    }

    // Rolling debounce: every merge pushes the deadline out by `delay`, never past the hard deadline. A merge with a
    // shorter window than the query's own never pulls the deadline in.
    fn merge(&self, query: &NormalizedQuery, now: Instant, delay: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != PendingState::Collecting {
            return false;
        }
        Self::absorb(&mut inner, query);
        inner.deadline = inner.deadline.max(now + delay).min(inner.hard_deadline);
        true
    }

    fn coverage(&self, query: &NormalizedQuery) -> Coverage {
        let inner = self.inner.lock();
        let months = query.months();
        if !months.iter().all(|m| inner.periods.contains(m)) {
            return Coverage::None;
        }
        if query.entities().iter().all(|e| inner.entities.contains(e)) {
            return Coverage::Full;
        }
        if query.is_cell() {
            let id = query.entities()[0].as_str();
            if inner.entities.iter().any(|e| e.is_pattern() && e.matches(id)) {
                return Coverage::Pattern;
            }
        }
        Coverage::None
    }

    fn try_dispatch(&self, now: Instant) -> DispatchStep {
        let mut inner = self.inner.lock();
        if inner.state != PendingState::Collecting {
            return DispatchStep::Gone;
        }
        if now < inner.deadline {
            return DispatchStep::Wait(inner.deadline);
        }
        inner.state = PendingState::Dispatched;
        DispatchStep::Dispatch(DispatchedBatch {
            request: RemoteRequest {
                entities: inner.entities.iter().cloned().collect(),
                periods:  inner.periods.iter().copied().collect(),
                filters:  self.filters.clone(),
            },
            needs:   inner.needs.values().cloned().collect(),
            merges:  inner.merges,
        })
    }

    // A detached query can never be dispatched by its collector.
    fn detach(&self) {
        self.inner.lock().state = PendingState::Dispatched;
    }

    /// Settle the result handle. Only the first settlement counts.
    pub(crate) fn settle(&self, outcome: Outcome) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            }
            else {
                false
            }
        });
    }
}

impl Debug for PendingQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PendingQuery")
            .field("id", &self.id)
            .field("merge_key", &self.merge_key)
            .field("state", &inner.state)
            .field("entities", &inner.entities.len())
            .field("periods", &inner.periods.len())
            .field("merges", &inner.merges)
            .finish()
    }
}

/// Result of [`PendingRegistry::join_or_create`].
#[derive(Debug)]
pub enum Admission {
    /// The local cache tier already had the value.
    Cached(f64),
    /// A new pending query was registered. The caller owns starting its collection window.
    Created(Arc<PendingQuery>),
    /// Merged into a collecting query, or attached to a dispatched one that covers everything needed.
    Joined(ResultHandle),
    /// A dispatched wildcard query will most likely produce the value; nothing was registered.
    Sibling,
}

#[derive(Debug, Default)]
struct Slot {
    collecting: Option<Arc<PendingQuery>>,
    dispatched: Vec<Arc<PendingQuery>>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.collecting.is_none() && self.dispatched.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PendingRegistry {
    slots:   Mutex<HashMap<MergeKey, Slot>>,
    next_id: AtomicU64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically find a pending query that can serve `query`, or register a new one.
    ///
    /// `cached` is consulted under the registry lock. Because a batch writes its results to the cache before it
    /// leaves the registry, a caller either sees the cached value or the pending query, never neither.
    ///
    /// Preference order: cached value, dispatched query covering every entity and month, collecting query (merge),
    /// dispatched wildcard sibling (only when `allow_sibling`), new query.
    pub fn join_or_create<F>(
        &self,
        query: &NormalizedQuery,
        now: Instant,
        delay: Duration,
        max_wait: Duration,
        allow_sibling: bool,
        cached: F,
    ) -> Admission
    where
        F: FnOnce() -> Option<f64>,
    {
        let mut slots = self.slots.lock();

        if let Some(value) = cached() {
            return Admission::Cached(value);
        }

        let slot = slots.entry(query.merge_key()).or_default();

        let mut sibling = false;
        for pq in &slot.dispatched {
            match pq.coverage(query) {
                Coverage::Full => {
                    debug!(query = %query, pending = pq.id, "joined dispatched query");
                    return Admission::Joined(pq.handle());
                }
                Coverage::Pattern => sibling = true,
                Coverage::None => (),
            }
        }

        if let Some(pq) = &slot.collecting {
            if pq.merge(query, now, delay) {
                debug!(query = %query, pending = pq.id, "merged into collecting query");
                return Admission::Joined(pq.handle());
            }
        }

        if sibling && allow_sibling {
            debug!(query = %query, "sibling wildcard query in flight");
            return Admission::Sibling;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let pq = Arc::new(PendingQuery::new(id, query, now, delay, max_wait));
        debug!(query = %query, pending = id, "created pending query");
        slot.collecting = Some(pq.clone());
        Admission::Created(pq)
    }

    /// Flip `pq` to dispatched if its collection deadline has passed. Done under the registry lock so that no
    /// caller can merge into it once its request has been taken.
    pub fn try_dispatch(&self, pq: &Arc<PendingQuery>, now: Instant) -> DispatchStep {
        let mut slots = self.slots.lock();
        let step = pq.try_dispatch(now);
        if let DispatchStep::Dispatch(_) = step {
            if let Some(slot) = slots.get_mut(&pq.merge_key) {
                if slot.collecting.as_ref().is_some_and(|c| Arc::ptr_eq(c, pq)) {
                    slot.collecting = None;
                }
                slot.dispatched.push(pq.clone());
            }
        }
        step
    }

    /// Unregister a settled (or settling) query. A query detached by [`clear`](Self::clear) is simply not found.
    pub fn remove(&self, pq: &Arc<PendingQuery>) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&pq.merge_key) {
            if slot.collecting.as_ref().is_some_and(|c| Arc::ptr_eq(c, pq)) {
                slot.collecting = None;
            }
            slot.dispatched.retain(|d| !Arc::ptr_eq(d, pq));
            if slot.is_empty() {
                slots.remove(&pq.merge_key);
            }
        }
    }

    /// Detach every pending query. Callers already attached keep their handles; new callers start over.
    /// Collecting queries that get detached are settled right away since their collectors will never dispatch.
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut *self.slots.lock());
        let mut count = 0;
        for (_, slot) in drained {
            if let Some(pq) = slot.collecting {
                pq.detach();
                pq.settle(Err(CoalesceError::Abandoned(pq.id)));
                count += 1;
            }
            count += slot.dispatched.len();
        }
        count
    }

    /// Number of registered pending queries.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .map(|s| s.dispatched.len() + usize::from(s.collecting.is_some()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::normalize::EvalParams;

    const DELAY: Duration = Duration::from_millis(150);
    const MAX: Duration = Duration::from_secs(1);

    fn q(entity: &str, period: &str) -> NormalizedQuery {
        normalize(&EvalParams::new(entity, period)).unwrap()
    }

    fn admit(reg: &PendingRegistry, query: &NormalizedQuery, now: Instant) -> Admission {
        reg.join_or_create(query, now, DELAY, MAX, true, || None)
    }

    #[tokio::test(start_paused = true)]
    async fn first_creates_rest_join() {
        let reg = PendingRegistry::new();
        let now = Instant::now();
        let query = q("100", "Jan 2024");

        let Admission::Created(pq) = admit(&reg, &query, now)
        else {
            panic!("first caller must create");
        };
        assert!(matches!(admit(&reg, &query, now), Admission::Joined(_)));
        assert!(matches!(admit(&reg, &q("200", "Jan 2024"), now), Admission::Joined(_)));
        assert_eq!(reg.len(), 1);

        let (entities, periods) = pq.accumulated();
        assert_eq!(entities.len(), 2);
        assert_eq!(periods.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_value_short_circuits() {
        let reg = PendingRegistry::new();
        let admission = reg.join_or_create(&q("100", "Jan 2024"), Instant::now(), DELAY, MAX, true, || Some(0.0));
        assert!(matches!(admission, Admission::Cached(v) if v == 0.0));
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_rolls_up_to_hard_deadline() {
        let reg = PendingRegistry::new();
        let start = Instant::now();
        let Admission::Created(pq) = admit(&reg, &q("100", "Jan 2024"), start)
        else {
            panic!("expected creation");
        };

        assert!(matches!(reg.try_dispatch(&pq, start), DispatchStep::Wait(d) if d == start + DELAY));

        // A merge 100ms in pushes the deadline to 250ms.
        admit(&reg, &q("101", "Jan 2024"), start + Duration::from_millis(100));
        assert!(matches!(
            reg.try_dispatch(&pq, start + DELAY),
            DispatchStep::Wait(d) if d == start + Duration::from_millis(250)
        ));

        // Merges close to the hard deadline cannot push past it.
        admit(&reg, &q("102", "Jan 2024"), start + Duration::from_millis(950));
        assert!(matches!(reg.try_dispatch(&pq, start + Duration::from_millis(960)), DispatchStep::Wait(d) if d == start + MAX));

        let DispatchStep::Dispatch(batch) = reg.try_dispatch(&pq, start + MAX)
        else {
            panic!("expected dispatch at the hard deadline");
        };
        assert_eq!(batch.request.entities.len(), 3);
        assert_eq!(batch.needs.len(), 3);
        assert!(matches!(reg.try_dispatch(&pq, start + MAX), DispatchStep::Gone));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_window_merge_keeps_the_deadline() {
        let reg = PendingRegistry::new();
        let start = Instant::now();
        let Admission::Created(pq) = admit(&reg, &q("100", "Jan 2024"), start)
        else {
            panic!("expected creation");
        };

        let later = start + Duration::from_millis(50);
        let admission = reg.join_or_create(&q("101", "Jan 2024"), later, Duration::ZERO, Duration::ZERO, false, || None);
        assert!(matches!(admission, Admission::Joined(_)));
        assert!(matches!(reg.try_dispatch(&pq, later), DispatchStep::Wait(d) if d == start + DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn after_flip_callers_attach_or_start_fresh() {
        let reg = PendingRegistry::new();
        let now = Instant::now();
        let Admission::Created(first) = admit(&reg, &q("100", "Jan 2024"), now)
        else {
            panic!("expected creation");
        };
        assert!(matches!(reg.try_dispatch(&first, now + DELAY), DispatchStep::Dispatch(_)));
        assert_eq!(first.state(), PendingState::Dispatched);

        // Same need: covered by the in-flight request.
        match admit(&reg, &q("100", "Jan 2024"), now + DELAY) {
            Admission::Joined(h) => assert_eq!(h.id(), first.id()),
            other => panic!("unexpected {other:?}"),
        }

        // New entity: never merged into the in-flight request, gets its own query.
        let Admission::Created(second) = admit(&reg, &q("200", "Jan 2024"), now + DELAY)
        else {
            panic!("expected a fresh query");
        };
        assert_ne!(second.id(), first.id());
        assert_eq!(reg.len(), 2);

        reg.remove(&first);
        reg.remove(&second);
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wildcard_in_flight_is_a_sibling() {
        let reg = PendingRegistry::new();
        let now = Instant::now();
        let Admission::Created(wild) = admit(&reg, &q("4*", "Jan 2024"), now)
        else {
            panic!("expected creation");
        };
        reg.try_dispatch(&wild, now + DELAY);

        assert!(matches!(admit(&reg, &q("4100", "Jan 2024"), now + DELAY), Admission::Sibling));
        assert!(matches!(
            reg.join_or_create(&q("4100", "Jan 2024"), now + DELAY, DELAY, MAX, false, || None),
            Admission::Created(_)
        ));
        // Not matched by the pattern.
        assert!(matches!(admit(&reg, &q("5100", "Jan 2024"), now + DELAY), Admission::Joined(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn settlement_is_broadcast_once() {
        let reg = PendingRegistry::new();
        let now = Instant::now();
        let Admission::Created(pq) = admit(&reg, &q("100", "Jan 2024"), now)
        else {
            panic!("expected creation");
        };
        let early = pq.handle();
        let late = pq.handle();

        pq.settle(Err(CoalesceError::Remote(crate::error::RemoteError::Timeout)));
        pq.settle(Ok(Arc::new(BatchValues::default())));

        assert!(late.is_settled());
        assert_eq!(
            early.wait().await.unwrap_err(),
            CoalesceError::Remote(crate::error::RemoteError::Timeout)
        );
        assert_eq!(
            late.wait().await.unwrap_err(),
            CoalesceError::Remote(crate::error::RemoteError::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_abandons_collecting_queries() {
        let reg = PendingRegistry::new();
        let now = Instant::now();
        let Admission::Created(pq) = admit(&reg, &q("100", "Jan 2024"), now)
        else {
            panic!("expected creation");
        };
        let handle = pq.handle();
        assert_eq!(reg.clear(), 1);
        assert!(reg.is_empty());
        assert!(matches!(reg.try_dispatch(&pq, now + MAX), DispatchStep::Gone));
        assert_eq!(handle.wait().await.unwrap_err(), CoalesceError::Abandoned(pq.id()));
    }
}
