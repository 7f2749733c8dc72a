use crate::build_mode::BuildMode;
use crate::build_mode::FlushStep;
use crate::build_mode::Intake;
use crate::build_mode::Queued;
use crate::build_mode::Ticket;
use crate::cache::ResultCache;
use crate::error::CoalesceError;
use crate::error::Result;
use crate::executor;
use crate::normalize::normalize;
use crate::normalize::EvalParams;
use crate::normalize::MergeKey;
use crate::normalize::NormalizedQuery;
use crate::pending::Admission;
use crate::pending::DispatchStep;
use crate::pending::DispatchedBatch;
use crate::pending::PendingQuery;
use crate::pending::PendingRegistry;
use crate::pending::ResultHandle;
use crate::store::MemoryStore;
use crate::traits::PersistentStore;
use crate::traits::RemoteSource;
use crate::types::BatchValues;
use crate::types::CoalesceStats;
use crate::wait::BoundedWait;
use fieldx_plus::fx_plus;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

// A caller whose pending query was abandoned (cache cleared under it) starts over at most this many times.
const MAX_ATTEMPTS: u32 = 3;

fn default_store() -> Arc<dyn PersistentStore> {
    Arc::new(MemoryStore::new())
}

#[derive(Debug, Default)]
struct Counters {
    evaluations:     AtomicU64,
    cache_hits:      AtomicU64,
    created:         AtomicU64,
    joined:          AtomicU64,
    sibling_waits:   AtomicU64,
    remote_calls:    AtomicU64,
    remote_failures: AtomicU64,
    build_flushes:   AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoalesceStats {
        CoalesceStats {
            evaluations:     self.evaluations.load(Ordering::Relaxed),
            cache_hits:      self.cache_hits.load(Ordering::Relaxed),
            created:         self.created.load(Ordering::Relaxed),
            joined:          self.joined.load(Ordering::Relaxed),
            sibling_waits:   self.sibling_waits.load(Ordering::Relaxed),
            remote_calls:    self.remote_calls.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            build_flushes:   self.build_flushes.load(Ordering::Relaxed),
        }
    }
}

/// The single entry point of the formula layer.
///
/// One coordinator owns the result cache, the pending request registry and the build-mode intake of one client.
/// Evaluations can be issued from any number of tasks; concurrent evaluations of the same or compatible queries
/// share remote calls.
///
/// ```ignore
/// let coordinator = Coordinator::builder()
///     .remote(LedgerClient::new(endpoint))
///     .store(Arc::new(JsonFileStore::open("ledger-cache.json")?))
///     .collection_delay(Duration::from_millis(100))
///     .build()?;
///
/// let revenue = coordinator
///     .evaluate(&EvalParams::new("4*", "Jan 2025").subsidiary("Acme (Consolidated)"))
///     .await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`Coordinator`].", "", "See [`Coordinator::builder()`] method."),
        method_doc("Implement builder pattern for [`Coordinator`]."),
    )
)]
pub struct Coordinator<RS>
where
    RS: RemoteSource,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    remote: Arc<RS>,

    /// Where the persistent tier lives. Defaults to a private in-memory store.
    #[fieldx(get(clone), default(default_store()))]
    store: Arc<dyn PersistentStore>,

    /// Prefix of every persistent key.
    #[fieldx(get(clone), builder(into), default(String::from("ledger")))]
    namespace: String,

    /// Bump it whenever the signature or key scheme changes: a mismatch invalidates the whole persistent tier.
    #[fieldx(get(copy), default(1))]
    schema_version: u32,

    #[fieldx(get(copy), default(Duration::from_secs(300)))]
    cache_ttl: Duration,

    /// Capacity of the local tier.
    #[fieldx(get(copy), default(100_000))]
    max_capacity: u64,

    /// Base collection window of a pending query, restarted by every merge.
    #[fieldx(get(copy), default(Duration::from_millis(150)))]
    collection_delay: Duration,

    /// Hard ceiling of the collection window.
    #[fieldx(get(copy), default(Duration::from_secs(1)))]
    collection_max_wait: Duration,

    #[fieldx(get(copy), default(Duration::from_millis(250)))]
    wait_interval: Duration,

    #[fieldx(get(copy), default(10))]
    wait_attempts: u32,

    #[fieldx(get(copy), default(Duration::from_millis(400)))]
    build_window: Duration,

    #[fieldx(get(copy), default(Duration::from_secs(3)))]
    build_max_wait: Duration,

    /// Number of cache misses within [`build_mode_detect`](Self::build_mode_detect) that turns build mode on.
    #[fieldx(get(copy), default(20))]
    build_mode_threshold: usize,

    #[fieldx(get(copy), default(Duration::from_millis(250)))]
    build_mode_detect: Duration,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    cache: Arc<ResultCache>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    registry: Arc<PendingRegistry>,

    #[fieldx(private, lazy, get(clone), builder(off))]
    build_mode: Arc<BuildMode>,

    #[fieldx(private, lazy, get(clone), builder(off))]
    counters: Arc<Counters>,
}

impl<RS> Coordinator<RS>
where
    RS: RemoteSource,
{
    fn build_cache(&self) -> Arc<ResultCache> {
        Arc::new(ResultCache::new(
            &self.namespace(),
            self.schema_version(),
            self.cache_ttl(),
            self.max_capacity(),
            self.store(),
        ))
    }

    fn build_registry(&self) -> Arc<PendingRegistry> {
        Arc::new(PendingRegistry::new())
    }

    fn build_build_mode(&self) -> Arc<BuildMode> {
        Arc::new(BuildMode::new(
            self.build_window(),
            self.build_max_wait(),
            self.build_mode_threshold(),
            self.build_mode_detect(),
        ))
    }

    fn build_counters(&self) -> Arc<Counters> {
        Arc::new(Counters::default())
    }

    fn bounded_wait(&self) -> BoundedWait {
        BoundedWait::new(self.wait_interval(), self.wait_attempts())
    }

    /// Evaluate one formula call.
    ///
    /// Always settles to a number proven by the remote service or to a classified error. Validation errors are
    /// raised before the cache or the registry are touched.
    #[instrument(level = "trace", skip(self), fields(entity = %params.entity, period = %params.from_period))]
    pub async fn evaluate(&self, params: &EvalParams) -> Result<f64> {
        let query = normalize(params)?;
        self.evaluate_query(query).await
    }

    /// Same as [`evaluate`](Self::evaluate), for an already normalized query.
    #[instrument(level = "trace", skip_all, fields(query = %query))]
    pub async fn evaluate_query(&self, query: NormalizedQuery) -> Result<f64> {
        let counters = self.counters();
        Counters::bump(&counters.evaluations);

        if let Some(value) = self.cache().lookup(query.signature()) {
            Counters::bump(&counters.cache_hits);
            return Ok(value);
        }

        let parked = match self.build_mode().offer(&query, Instant::now()) {
            Intake::Bypass => None,
            Intake::Parked { ticket, start_flusher } => {
                if start_flusher {
                    self.spawn_build_flusher()?;
                }
                // A dropped ticket means the intake went away; the normal path still works.
                ticket.await.ok()
            }
        };

        let handle = match parked {
            Some(Ticket::Cached(value)) => {
                Counters::bump(&counters.cache_hits);
                return Ok(value);
            }
            Some(Ticket::Handle(handle)) => Some(handle),
            None => None,
        };

        self.resolve(&query, handle).await
    }

    /// Evaluate many calls at once, e.g. a pasted range. Results come back in input order.
    pub async fn evaluate_many(&self, params: &[EvalParams]) -> Vec<Result<f64>> {
        let mut tasks = Vec::with_capacity(params.len());
        for p in params {
            let myself = self.myself().ok_or(CoalesceError::Shutdown);
            let p = p.clone();
            tasks.push(tokio::spawn(async move {
                match myself {
                    Ok(myself) => myself.evaluate(&p).await,
                    Err(err) => Err(err),
                }
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(executor::joined_evaluation(task.await));
        }
        results
    }

    /// Cache-only lookup. `Ok(None)` is a miss, `Ok(Some(0.0))` a hit.
    pub fn lookup(&self, params: &EvalParams) -> Result<Option<f64>> {
        let query = normalize(params)?;
        Ok(self.cache().lookup(query.signature()))
    }

    /// Store a known value, e.g. one restored from a saved workbook.
    pub fn prime(&self, params: &EvalParams, value: f64) -> Result<()> {
        let query = normalize(params)?;
        self.cache().write(query.signature().clone(), value);
        Ok(())
    }

    fn admit(&self, query: &NormalizedQuery, allow_sibling: bool) -> Admission {
        let cache = self.cache();
        self.registry().join_or_create(
            query,
            Instant::now(),
            self.collection_delay(),
            self.collection_max_wait(),
            allow_sibling,
            || cache.lookup_local(query.signature()),
        )
    }

    async fn resolve(&self, query: &NormalizedQuery, mut handle: Option<ResultHandle>) -> Result<f64> {
        let counters = self.counters();
        let mut allow_sibling = true;
        let mut attempts = 0;

        loop {
            let current = match handle.take() {
                Some(handle) => handle,
                None => match self.admit(query, allow_sibling) {
                    Admission::Cached(value) => {
                        Counters::bump(&counters.cache_hits);
                        return Ok(value);
                    }
                    Admission::Created(pq) => {
                        Counters::bump(&counters.created);
                        let handle = pq.handle();
                        self.spawn_collector(pq)?;
                        handle
                    }
                    Admission::Joined(handle) => {
                        Counters::bump(&counters.joined);
                        handle
                    }
                    Admission::Sibling => {
                        Counters::bump(&counters.sibling_waits);
                        allow_sibling = false;
                        let cache = self.cache();
                        if let Some(value) = self.bounded_wait().poll(|| cache.lookup(query.signature())).await {
                            return Ok(value);
                        }
                        debug!(query = %query, "sibling did not produce the value, starting own attempt");
                        continue;
                    }
                },
            };

            let pending = current.id();
            match current.wait().await {
                Ok(values) => {
                    if let Some(value) = values.resolve(query) {
                        self.remember(query, &values, value);
                        return Ok(value);
                    }
                    // Joined a dispatched query whose result turned out not to cover us.
                    debug!(query = %query, pending, "settled batch does not cover the query");
                    allow_sibling = false;
                }
                Err(CoalesceError::Abandoned(id)) if attempts < MAX_ATTEMPTS => {
                    attempts += 1;
                    debug!(query = %query, pending = id, attempts, "pending query abandoned, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    // Aggregates of callers that attached after dispatch aren't among the batch needs.
    fn remember(&self, query: &NormalizedQuery, values: &BatchValues, value: f64) {
        if query.is_cell() {
            return;
        }
        let cache = self.cache();
        if cache.lookup_local(query.signature()).is_none() {
            cache.write_many_at(values.generation(), vec![(query.signature().clone(), value)]);
        }
    }

    fn spawn_collector(&self, pq: Arc<PendingQuery>) -> Result<()> {
        let Some(myself) = self.myself()
        else {
            self.registry().remove(&pq);
            pq.settle(Err(CoalesceError::Shutdown));
            return Err(CoalesceError::Shutdown);
        };
        tokio::spawn(async move { myself.run_collection(pq).await });
        Ok(())
    }

    async fn run_collection(&self, pq: Arc<PendingQuery>) {
        let registry = self.registry();
        loop {
            match registry.try_dispatch(&pq, Instant::now()) {
                DispatchStep::Wait(deadline) => tokio::time::sleep_until(deadline).await,
                DispatchStep::Dispatch(batch) => {
                    self.execute_batch(pq, batch).await;
                    break;
                }
                DispatchStep::Gone => {
                    debug!(pending = pq.id(), "pending query detached before dispatch");
                    break;
                }
            }
        }
    }

    #[instrument(level = "trace", skip_all, fields(pending = pq.id()))]
    async fn execute_batch(&self, pq: Arc<PendingQuery>, batch: DispatchedBatch) {
        let cache = self.cache();
        let counters = self.counters();
        let generation = cache.generation();
        let remote = self.remote();

        Counters::bump(&counters.remote_calls);
        info!(
            pending = pq.id(),
            merge_key = %pq.merge_key(),
            entities = batch.request.entities.len(),
            periods = batch.request.periods.len(),
            merges = batch.merges,
            remote = remote.name(),
            "dispatching batch"
        );

        let started = Instant::now();
        let outcome = match executor::call_remote(remote, batch.request.clone()).await {
            Ok(response) => {
                let values = BatchValues::from_response(&batch.request, response).with_generation(generation);
                let entries = executor::cache_entries(&batch, &values);
                let written = entries.len();
                // Stores may do file I/O; keep it off the async workers.
                let writer = cache.clone();
                match tokio::task::spawn_blocking(move || writer.write_many_at(generation, entries)).await {
                    Ok(true) => debug!(pending = pq.id(), written, elapsed = ?started.elapsed(), "batch results cached"),
                    Ok(false) => (),
                    Err(err) => warn!(pending = pq.id(), %err, "batch results write failed"),
                }
                Ok(Arc::new(values))
            }
            Err(err) => {
                Counters::bump(&counters.remote_failures);
                warn!(pending = pq.id(), %err, elapsed = ?started.elapsed(), "remote call failed");
                Err(CoalesceError::Remote(err))
            }
        };

        // Results are in the cache before the query leaves the registry, so a newcomer finds one or the other.
        self.registry().remove(&pq);
        pq.settle(outcome);
    }

    fn spawn_build_flusher(&self) -> Result<()> {
        let myself = self.myself().ok_or(CoalesceError::Shutdown)?;
        tokio::spawn(async move { myself.run_build_flush().await });
        Ok(())
    }

    async fn run_build_flush(&self) {
        let build_mode = self.build_mode();
        loop {
            match build_mode.poll_flush(Instant::now()) {
                FlushStep::Wait(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => (),
                        _ = build_mode.woken() => (),
                    }
                }
                FlushStep::Flush(items) => {
                    self.admit_build_groups(items);
                    break;
                }
            }
        }
    }

    // Every group is admitted with a zero collection window: its members already waited in the intake.
    fn admit_build_groups(&self, items: Vec<Queued>) {
        if items.is_empty() {
            return;
        }

        let counters = self.counters();
        Counters::bump(&counters.build_flushes);

        let mut groups: BTreeMap<MergeKey, Vec<Queued>> = BTreeMap::new();
        for item in items {
            groups.entry(item.query.merge_key()).or_default().push(item);
        }

        let cache = self.cache();
        let registry = self.registry();
        let mut created = Vec::new();
        for (merge_key, group) in groups {
            info!(%merge_key, size = group.len(), "admitting build mode group");
            let now = Instant::now();
            for Queued { query, reply } in group {
                let ticket = match registry.join_or_create(&query, now, Duration::ZERO, Duration::ZERO, false, || {
                    cache.lookup_local(query.signature())
                }) {
                    Admission::Cached(value) => Ticket::Cached(value),
                    Admission::Created(pq) => {
                        Counters::bump(&counters.created);
                        let handle = pq.handle();
                        created.push(pq);
                        Ticket::Handle(handle)
                    }
                    Admission::Joined(handle) => {
                        Counters::bump(&counters.joined);
                        Ticket::Handle(handle)
                    }
                    Admission::Sibling => continue,
                };
                // The caller may be gone; its share of the batch is still fetched.
                let _ = reply.send(ticket);
            }
        }

        // Collectors start only once every group is admitted so no group is split by an early dispatch.
        for pq in created {
            if let Err(err) = self.spawn_collector(pq) {
                warn!(%err, "cannot start collector for build mode group");
            }
        }
    }

    /// Force build mode on until [`exit_build_mode`](Self::exit_build_mode) is called.
    pub fn enter_build_mode(&self) {
        info!("entering build mode");
        self.build_mode().force(true);
    }

    /// Stop forcing build mode and flush whatever is parked in the intake.
    pub fn exit_build_mode(&self) {
        info!("leaving build mode");
        self.build_mode().force(false);
    }

    pub fn is_build_mode(&self) -> bool {
        self.build_mode().is_active(Instant::now())
    }

    /// Empty both cache tiers and detach every pending query.
    ///
    /// Callers merged into a query that has not been dispatched yet start over with a fresh attempt. Batches
    /// already in flight still settle their waiters but their results are not written to the cache.
    #[instrument(level = "trace", skip(self))]
    pub fn clear_cache(&self) {
        self.cache().clear();
        let detached = self.registry().clear();
        info!(namespace = %self.namespace(), detached, "cache cleared");
    }

    pub fn stats(&self) -> CoalesceStats {
        self.counters().snapshot()
    }

    /// Number of pending queries currently known to the registry.
    pub fn pending_count(&self) -> usize {
        self.registry().len()
    }
}
