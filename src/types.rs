use crate::normalize::Entity;
use crate::normalize::FilterSet;
use crate::normalize::NormalizedQuery;
use crate::period::Period;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

/// One call to the remote ledger service: every entity for every period, in one filter context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub entities: Vec<Entity>,
    pub periods:  Vec<Period>,
    pub filters:  FilterSet,
}

impl RemoteRequest {
    pub fn contains_entity(&self, id: &str) -> bool {
        self.entities.iter().any(|e| matches!(e, Entity::Id(own) if own == id))
    }
}

/// Per-account, per-period values returned by the remote service.
///
/// Accounts without activity may be left out by the service; the batch executor fills them in with zero for
/// every explicitly requested account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub values: HashMap<String, BTreeMap<Period, f64>>,
}

impl RemoteResponse {
    pub fn insert<S: Into<String>>(&mut self, entity: S, period: Period, value: f64) {
        self.values.entry(entity.into()).or_default().insert(period, value);
    }
}

/// The settled result of one batch, shared by every caller merged into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchValues {
    patterns:   BTreeSet<String>,
    months:     BTreeSet<Period>,
    values:     HashMap<String, BTreeMap<Period, f64>>,
    generation: u64,
}

impl BatchValues {
    /// Merge the response with the request so that every requested account has a value for every requested month.
    pub(crate) fn from_response(request: &RemoteRequest, response: RemoteResponse) -> Self {
        let months = request.periods.iter().copied().collect::<BTreeSet<_>>();
        let mut values = response.values;

        for entity in &request.entities {
            if let Entity::Id(id) = entity {
                let per_period = values.entry(id.clone()).or_default();
                for month in &months {
                    per_period.entry(*month).or_insert(0.0);
                }
            }
        }

        Self {
            patterns: request
                .entities
                .iter()
                .filter(|e| e.is_pattern())
                .map(|e| e.as_str().to_string())
                .collect(),
            months,
            values,
            generation: 0,
        }
    }

    /// Tag the values with the cache generation they were fetched under.
    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The value of `query` according to this batch, or `None` when the batch didn't cover it.
    pub fn resolve(&self, query: &NormalizedQuery) -> Option<f64> {
        let months = query.months();
        if !months.iter().all(|m| self.months.contains(m)) {
            return None;
        }

        // An account named explicitly and matched by a pattern, or matched by two patterns, counts once.
        let mut resolved = BTreeSet::new();
        for entity in query.entities() {
            match entity {
                Entity::Id(id) => {
                    let per_period = self.values.get(id)?;
                    if !months.iter().all(|m| per_period.contains_key(m)) {
                        return None;
                    }
                    resolved.insert(id.as_str());
                }
                Entity::Pattern(pattern) => {
                    if !self.patterns.contains(pattern) {
                        return None;
                    }
                    resolved.extend(self.values.keys().filter(|id| entity.matches(id)).map(String::as_str));
                }
            }
        }

        Some(
            resolved
                .into_iter()
                .filter_map(|id| self.values.get(id))
                .map(|per_period| months.iter().filter_map(|m| per_period.get(m)).sum::<f64>())
                .sum(),
        )
    }

    /// Every (account, month, value) triple the batch proved.
    pub fn cells(&self) -> impl Iterator<Item = (&str, &Period, f64)> + '_ {
        self.values.iter().flat_map(|(id, per_period)| {
            per_period
                .iter()
                .filter(|(month, _)| self.months.contains(*month))
                .map(move |(month, value)| (id.as_str(), month, *value))
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Point-in-time counters of a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoalesceStats {
    pub evaluations:     u64,
    pub cache_hits:      u64,
    pub created:         u64,
    pub joined:          u64,
    pub sibling_waits:   u64,
    pub remote_calls:    u64,
    pub remote_failures: u64,
    pub build_flushes:   u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::normalize::EvalParams;

    fn month(raw: &str) -> Period {
        raw.parse().unwrap()
    }

    fn request(query: &NormalizedQuery) -> RemoteRequest {
        RemoteRequest {
            entities: query.entities().to_vec(),
            periods:  query.months(),
            filters:  query.filters().clone(),
        }
    }

    #[test]
    fn explicit_accounts_are_zero_filled() {
        let query = normalize(&EvalParams::new("100,200", "Jan 2024").to_period("Feb 2024")).unwrap();
        let mut response = RemoteResponse::default();
        response.insert("100", month("Feb 2024"), 4.0);

        let values = BatchValues::from_response(&request(&query), response);
        assert_eq!(values.len(), 2);
        assert_eq!(values.cells().count(), 4);
        assert_eq!(values.resolve(&query), Some(4.0));
        assert_eq!(
            values.resolve(&normalize(&EvalParams::new("200", "Jan 2024")).unwrap()),
            Some(0.0)
        );
    }

    #[test]
    fn patterns_sum_reported_accounts_only() {
        let query = normalize(&EvalParams::new("4*", "Mar 2024")).unwrap();
        let mut response = RemoteResponse::default();
        response.insert("4100", month("Mar 2024"), 1.5);
        response.insert("4200", month("Mar 2024"), 2.5);

        let values = BatchValues::from_response(&request(&query), response);
        assert_eq!(values.resolve(&query), Some(4.0));
        assert_eq!(
            values.resolve(&normalize(&EvalParams::new("4100", "Mar 2024")).unwrap()),
            Some(1.5)
        );
        // Not reported and not explicitly requested: unknown, not zero.
        assert_eq!(values.resolve(&normalize(&EvalParams::new("4300", "Mar 2024")).unwrap()), None);
    }

    #[test]
    fn uncovered_months_are_unknown() {
        let query = normalize(&EvalParams::new("100", "Jan 2024")).unwrap();
        let values = BatchValues::from_response(&request(&query), RemoteResponse::default());
        assert_eq!(values.resolve(&query), Some(0.0));
        assert_eq!(values.resolve(&normalize(&EvalParams::new("100", "Feb 2024")).unwrap()), None);
        assert_eq!(values.resolve(&normalize(&EvalParams::new("3*", "Jan 2024")).unwrap()), None);
    }

    #[test]
    fn overlapping_entities_count_each_account_once() {
        let query = normalize(&EvalParams::new("4100, 4*, 41*", "Jan 2024")).unwrap();
        let mut response = RemoteResponse::default();
        response.insert("4100", month("Jan 2024"), 10.0);
        response.insert("4200", month("Jan 2024"), 5.0);

        let values = BatchValues::from_response(&request(&query), response);
        assert_eq!(values.resolve(&query), Some(15.0));
        assert_eq!(values.resolve(&normalize(&EvalParams::new("4100, 4*", "Jan 2024")).unwrap()), Some(15.0));
        assert_eq!(values.resolve(&normalize(&EvalParams::new("4*, 41*", "Jan 2024")).unwrap()), Some(15.0));
        assert_eq!(values.resolve(&normalize(&EvalParams::new("41*, 4100", "Jan 2024")).unwrap()), Some(10.0));
    }
}
