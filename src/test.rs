#![cfg(any(test, feature = "test"))]
//! Test doubles shared by unit tests, integration tests and the burst demo.

use crate::error::RemoteError;
use crate::period::Period;
use crate::traits::RemoteSource;
use crate::types::RemoteRequest;
use crate::types::RemoteResponse;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// In-process stand-in for the remote ledger service.
///
/// Holds a small general ledger of account/month balances. Like the real service it leaves accounts without
/// activity (zero balance) out of its responses and expands wildcard patterns itself. Every request is recorded.
#[derive(Debug, Default)]
pub struct MockRemote {
    latency:  Duration,
    ledger:   Mutex<BTreeMap<String, BTreeMap<Period, f64>>>,
    calls:    Mutex<Vec<RemoteRequest>>,
    failures: Mutex<VecDeque<RemoteError>>,
    panics:   AtomicUsize,
    inflight: AtomicUsize,
    peak:     AtomicUsize,
}

fn period(raw: &str) -> Period {
    raw.parse()
        .unwrap_or_else(|err| panic!("bad period '{raw}' in test ledger: {err}"))
}

impl MockRemote {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    /// Chainable form of [`set_value`](Self::set_value).
    pub fn with_value(self, account: &str, month: &str, value: f64) -> Self {
        self.set_value(account, month, value);
        self
    }

    pub fn set_value(&self, account: &str, month: &str, value: f64) {
        self.ledger
            .lock()
            .entry(account.to_string())
            .or_default()
            .insert(period(month), value);
    }

    /// The next call fails with `err` after the usual latency.
    pub fn fail_next(&self, err: RemoteError) {
        self.failures.lock().push_back(err);
    }

    /// The next call panics after the usual latency.
    pub fn panic_next(&self) {
        self.panics.fetch_add(1, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of calls that were ever outstanding at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &RemoteRequest) -> RemoteResponse {
        let ledger = self.ledger.lock();
        let mut response = RemoteResponse::default();
        for (account, balances) in ledger.iter() {
            if !request.entities.iter().any(|e| e.matches(account)) {
                continue;
            }
            for month in &request.periods {
                match balances.get(month) {
                    Some(value) if *value != 0.0 => response.insert(account.clone(), *month, *value),
                    _ => (),
                }
            }
        }
        response
    }
}

#[async_trait]
impl RemoteSource for MockRemote {
    async fn fetch(&self, request: &RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        self.calls.lock().push(request.clone());
        let failure = self.failures.lock().pop_front();
        let panics = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        if panics {
            panic!("mock ledger service crashed");
        }
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(self.respond(request))
    }

    fn name(&self) -> &str {
        "mock-ledger"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::normalize::EvalParams;

    #[tokio::test(start_paused = true)]
    async fn omits_zero_balances_and_expands_patterns() {
        let remote = MockRemote::new(Duration::from_secs(1))
            .with_value("4100", "Jan 2024", 10.0)
            .with_value("4200", "Jan 2024", 0.0)
            .with_value("5100", "Jan 2024", 7.0);
        let query = normalize(&EvalParams::new("4*", "Jan 2024")).unwrap();
        let request = RemoteRequest {
            entities: query.entities().to_vec(),
            periods:  query.months(),
            filters:  query.filters().clone(),
        };

        let response = remote.fetch(&request).await.unwrap();
        assert_eq!(response.values.len(), 1);
        assert_eq!(response.values["4100"][&period("Jan 2024")], 10.0);
        assert_eq!(remote.call_count(), 1);
    }
}
