use crate::error::CoalesceError;
use crate::error::RemoteError;
use crate::normalize::FilterSet;
use crate::normalize::QuerySignature;
use crate::pending::DispatchedBatch;
use crate::traits::RemoteSource;
use crate::types::BatchValues;
use crate::types::RemoteRequest;
use crate::types::RemoteResponse;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::error;
use tracing::instrument;

/// Issue the one remote call of a batch.
///
/// The call runs on its own task so that a panicking collaborator surfaces as a [`RemoteError::Service`] instead
/// of taking the waiters of the batch down with it.
#[instrument(level = "trace", skip_all, fields(remote = remote.name(), entities = request.entities.len()))]
pub(crate) async fn call_remote<RS>(remote: Arc<RS>, request: RemoteRequest) -> Result<RemoteResponse, RemoteError>
where
    RS: RemoteSource,
{
    let task = tokio::spawn(async move { remote.fetch(&request).await });
    match task.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(RemoteError::Service("remote call panicked".to_string())),
        Err(err) => Err(RemoteError::Service(format!("remote call aborted: {err}"))),
    }
}

/// Outcome of an evaluation that ran on its own task. A panic is reported as such, not as a shutdown.
pub(crate) fn joined_evaluation(joined: Result<Result<f64, CoalesceError>, JoinError>) -> Result<f64, CoalesceError> {
    match joined {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => {
            error!(%err, "evaluation task panicked");
            Err(CoalesceError::Task("evaluation panicked".to_string()))
        }
        Err(err) => {
            error!(%err, "evaluation task was cancelled");
            Err(CoalesceError::Task(err.to_string()))
        }
    }
}

/// Everything a successful batch writes through the cache: one entry per proven (account, month) cell plus the
/// aggregate of every need merged into the batch.
pub(crate) fn cache_entries(batch: &DispatchedBatch, values: &BatchValues) -> Vec<(QuerySignature, f64)> {
    let filters: &FilterSet = &batch.request.filters;
    let mut entries = values
        .cells()
        .map(|(id, month, value)| (QuerySignature::cell(id, filters, month), value))
        .collect::<BTreeMap<_, _>>();

    for need in &batch.needs {
        if need.is_cell() || entries.contains_key(need.signature()) {
            continue;
        }
        if let Some(value) = values.resolve(need) {
            entries.insert(need.signature().clone(), value);
        }
    }

    entries.into_iter().collect()
}
