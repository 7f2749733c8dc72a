use async_trait::async_trait;

use crate::error::RemoteError;
use crate::error::StoreError;
use crate::types::RemoteRequest;
use crate::types::RemoteResponse;

/// The slow remote ledger service.
///
/// Implementations build and run the actual financial query. The coordinator guarantees that at most one `fetch`
/// is outstanding per merged batch, and that `fetch` runs on its own task: a panic inside it is reported to every
/// waiter as [`RemoteError::Service`].
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
    /// Return per-account, per-period values for every entity and period of the request.
    ///
    /// Wildcard entities are expanded by the service; every concrete account it reports is cached. Accounts
    /// without activity may be omitted.
    async fn fetch(&self, request: &RemoteRequest) -> Result<RemoteResponse, RemoteError>;

    /// Short name for logging.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Key/value storage backing the persistent cache tier.
///
/// It is shared by every execution context of the same client, hence synchronous and `Sync`. Values are opaque
/// strings; the cache owns their encoding.
pub trait PersistentStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;

    fn set_many(&self, entries: Vec<(String, String)>) -> Result<(), StoreError>;

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.set_many(vec![(key.to_string(), value)])
    }

    /// Drop every key starting with `prefix`.
    fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError>;
}
