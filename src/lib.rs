//! # ledger-cache
//!
//! Request coalescing and result caching between bursty spreadsheet formula evaluation and a slow, rate-limited
//! ledger service.
//!
//! Think of it as a single-flight layer with a memory.
//!
//! # The Problem
//!
//! A spreadsheet recalculation can invoke the same or overlapping formulas hundreds of times within milliseconds
//! (fill-down, fill-right, paste, full recalc), while the service behind them needs seconds to minutes to answer
//! a single query. Issuing one remote call per cell is not an option.
//!
//! # The Basics
//!
//! The crate guarantees that:
//!
//! - there is at most one outstanding remote call per logical query;
//! - every evaluation eventually settles to a number or to a classified error, never to a placeholder;
//! - zero is a valid, cacheable result and is never used in place of "missing" or "still loading".
//!
//! Evaluation goes through the following stages:
//!
//! 1. The raw parameters are normalized into a [`NormalizedQuery`] with a canonical [`QuerySignature`].
//!    Malformed input is rejected here with a [`ValidationError`], before anything else is touched.
//! 2. The two-tier [result cache](cache::ResultCache) is checked: a private [moka](https://crates.io/crates/moka)
//!    cache first, then a [`PersistentStore`] shared with other execution contexts of the same client.
//! 3. The [pending request registry](pending::PendingRegistry) is checked. Queries sharing a filter context are
//!    merged into one pending query while it is still collecting; a query that was already dispatched is joined
//!    only if its request covers everything the caller needs.
//! 4. The collection window of a pending query is a rolling debounce with a hard ceiling. When it closes the
//!    query flips to dispatched and the batch executor issues exactly one remote call for the merged set of
//!    accounts and months.
//! 5. Results, including zeroes for accounts without activity, are written through both cache tiers and then
//!    broadcast to every caller merged into the query.
//!
//! When a single-account caller misses a wildcard batch that will most likely produce its value, it doesn't start
//! its own query right away: it polls the cache with a [bounded wait](wait::BoundedWait) first and only falls back
//! to a fresh query if the value doesn't show up.
//!
//! Large bursts of independent evaluations switch the coordinator into build mode: cache misses are parked in an
//! intake for a short rolling window and then admitted group by group, so a fill-down of a thousand cells turns
//! into a handful of remote calls.
//!
//! # Data Source
//!
//! The remote service is abstracted by the [`RemoteSource`] trait. It receives a [`RemoteRequest`] (accounts,
//! months, filters) and returns per-account, per-month values. Accounts with no activity may simply be left out.
//!
//! ```ignore
//! let coordinator = Coordinator::builder()
//!     .remote(LedgerClient::connect(url).await?)
//!     .store(Arc::new(JsonFileStore::open(cache_path)?))
//!     .build()?;
//!
//! let cash = coordinator.evaluate(&EvalParams::new("1000", "Jan 2025")).await?;
//! let revenue = coordinator
//!     .evaluate(&EvalParams::new("4*", "2024").subsidiary("Acme (Consolidated)"))
//!     .await?;
//! ```

pub mod build_mode;
pub mod cache;
pub mod coordinator;
pub mod error;
pub(crate) mod executor;
pub mod normalize;
pub mod pending;
pub mod period;
pub mod store;
pub mod test;
pub mod traits;
pub mod types;
pub mod wait;

#[doc(inline)]
pub use coordinator::Coordinator;
#[doc(inline)]
pub use error::CoalesceError;
#[doc(inline)]
pub use error::ValidationError;
#[doc(inline)]
pub use normalize::EvalParams;
#[doc(inline)]
pub use normalize::NormalizedQuery;
#[doc(inline)]
pub use normalize::QuerySignature;
#[doc(inline)]
pub use traits::PersistentStore;
#[doc(inline)]
pub use traits::RemoteSource;
#[doc(inline)]
pub use types::RemoteRequest;

pub mod prelude {
    pub use crate::coordinator::Coordinator;
    pub use crate::error::*;
    pub use crate::normalize::normalize;
    pub use crate::normalize::EvalParams;
    pub use crate::normalize::NormalizedQuery;
    pub use crate::period::Period;
    pub use crate::store::JsonFileStore;
    pub use crate::store::MemoryStore;
    pub use crate::traits::*;
    pub use crate::types::*;
}
