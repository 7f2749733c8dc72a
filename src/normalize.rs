//! Query normalization: raw formula parameters in, canonical [`QuerySignature`] out.
//!
//! Normalization is pure and total. Two calls that ask the same thing (same accounts after sorting and
//! deduplication, same period after year expansion, same filters after defaulting) always produce the same
//! signature, no matter in which order their parts were written.

use crate::error::ValidationError;
use crate::period::Period;
use crate::period::PeriodSpec;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::sync::Arc;

/// Placeholder for an omitted or blank optional filter.
pub const FILTER_SENTINEL: &str = "~";
/// Accounting book used when none is given.
pub const DEFAULT_BOOK: &str = "1";

const CONSOLIDATED_SUFFIX: &str = "(consolidated)";

/// Raw parameters of one formula evaluation, as handed over by the formula layer.
///
/// Only the fields listed here are accepted. Optional filters default to "not filtered", the book defaults to
/// [`DEFAULT_BOOK`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvalParams {
    /// Account id, wildcard pattern (`4*`), or comma-separated set of either.
    pub entity:      String,
    pub from_period: String,
    pub to_period:   Option<String>,
    pub subsidiary:  Option<String>,
    pub department:  Option<String>,
    pub location:    Option<String>,
    pub class:       Option<String>,
    pub book:        Option<String>,
}

impl EvalParams {
    pub fn new<E: Into<String>, P: Into<String>>(entity: E, period: P) -> Self {
        Self {
            entity: entity.into(),
            from_period: period.into(),
            ..Default::default()
        }
    }

    pub fn to_period<S: Into<String>>(mut self, to: S) -> Self {
        self.to_period = Some(to.into());
        self
    }

    pub fn subsidiary<S: Into<String>>(mut self, subsidiary: S) -> Self {
        self.subsidiary = Some(subsidiary.into());
        self
    }

    pub fn department<S: Into<String>>(mut self, department: S) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn location<S: Into<String>>(mut self, location: S) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn class<S: Into<String>>(mut self, class: S) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn book<S: Into<String>>(mut self, book: S) -> Self {
        self.book = Some(book.into());
        self
    }
}

/// One account, or a wildcard pattern over account ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Entity {
    Id(String),
    Pattern(String),
}

impl Entity {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyEntity);
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ' | '*'))
        {
            return Err(ValidationError::MalformedEntity(trimmed.to_string()));
        }

        if trimmed.contains('*') {
            // Runs of `*` mean the same as one.
            let mut pattern = String::with_capacity(trimmed.len());
            for c in trimmed.chars() {
                if !(c == '*' && pattern.ends_with('*')) {
                    pattern.push(c);
                }
            }
            if pattern == "*" {
                return Err(ValidationError::UnboundedPattern(trimmed.to_string()));
            }
            Ok(Self::Pattern(pattern))
        }
        else {
            Ok(Self::Id(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Id(s) | Self::Pattern(s) => s,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Self::Pattern(_))
    }

    /// Whether the concrete account `id` is this entity or is matched by this pattern.
    pub fn matches(&self, id: &str) -> bool {
        match self {
            Self::Id(own) => own == id,
            Self::Pattern(pattern) => glob_match(pattern, id),
        }
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// `*` matches any run of characters, everything else matches itself.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(head) = parts.next()
    else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(head)
    else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last()
    else {
        // No `*` at all.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// The filter context of a query: reporting dimensions plus the accounting book.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FilterSet {
    subsidiary:   Option<String>,
    consolidated: bool,
    department:   Option<String>,
    location:     Option<String>,
    class:        Option<String>,
    book:         String,
}

impl FilterSet {
    fn normalize_value(name: &'static str, value: Option<&str>) -> Result<Option<String>, ValidationError> {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty() && *v != FILTER_SENTINEL)
        else {
            return Ok(None);
        };
        if value.chars().any(|c| c.is_control() || c == '|' || c == ':') {
            return Err(ValidationError::InvalidFilter {
                name,
                value: value.to_string(),
            });
        }
        Ok(Some(value.split_whitespace().collect::<Vec<_>>().join(" ")))
    }

    pub fn from_params(params: &EvalParams) -> Result<Self, ValidationError> {
        let mut consolidated = false;
        let subsidiary = Self::normalize_value("subsidiary", params.subsidiary.as_deref())?.and_then(|sub| {
            let lower = sub.to_ascii_lowercase();
            if lower.ends_with(CONSOLIDATED_SUFFIX) {
                consolidated = true;
                let bare = sub[..sub.len() - CONSOLIDATED_SUFFIX.len()].trim_end().to_string();
                (!bare.is_empty()).then_some(bare)
            }
            else {
                Some(sub)
            }
        });

        let book = Self::normalize_value("book", params.book.as_deref())?.unwrap_or_else(|| DEFAULT_BOOK.to_string());
        if !book.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidFilter { name: "book", value: book });
        }

        Ok(Self {
            subsidiary,
            consolidated,
            department: Self::normalize_value("department", params.department.as_deref())?,
            location: Self::normalize_value("location", params.location.as_deref())?,
            class: Self::normalize_value("class", params.class.as_deref())?,
            book,
        })
    }

    pub fn subsidiary(&self) -> Option<&str> {
        self.subsidiary.as_deref()
    }

    pub fn is_consolidated(&self) -> bool {
        self.consolidated
    }

    pub fn department(&self) -> Option<&str> {
        self.department.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    pub fn book(&self) -> &str {
        &self.book
    }

    /// Canonical textual form. Every field is always present; absent ones carry [`FILTER_SENTINEL`].
    pub fn canonical(&self) -> String {
        let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| FILTER_SENTINEL.to_string());
        format!(
            "sub={}{}|dept={}|loc={}|class={}|book={}",
            opt(&self.subsidiary),
            if self.consolidated { "+c" } else { "" },
            opt(&self.department),
            opt(&self.location),
            opt(&self.class),
            self.book
        )
    }

    /// First 16 hex digits of SHA-256 over [`canonical()`](Self::canonical). Stable across processes.
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

impl Default for FilterSet {
    fn default() -> Self {
        Self {
            subsidiary:   None,
            consolidated: false,
            department:   None,
            location:     None,
            class:        None,
            book:         DEFAULT_BOOK.to_string(),
        }
    }
}

/// Canonical identity of one logical query: `{entities}:{filterHash}:{period}`.
///
/// The persisted cache key is this string prefixed with the cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuerySignature(Arc<str>);

impl QuerySignature {
    fn build<'a>(entities: impl Iterator<Item = &'a str>, filter_hash: &str, period: &dyn Display) -> Self {
        let entities = entities.collect::<Vec<_>>().join(",");
        Self(Arc::from(format!("{entities}:{filter_hash}:{period}")))
    }

    /// Signature of the single-account, single-month query. Batch results are written under these.
    pub fn cell(entity_id: &str, filters: &FilterSet, period: &Period) -> Self {
        Self::build(std::iter::once(entity_id), &filters.hash(), period)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key under which compatible queries are merged into one pending query: queries that differ only in entity or
/// period membership share it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MergeKey(Arc<str>);

impl Display for MergeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated query with its canonical signature precomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    entities:  Vec<Entity>,
    period:    PeriodSpec,
    filters:   FilterSet,
    signature: QuerySignature,
}

impl NormalizedQuery {
    pub fn new(entities: Vec<Entity>, period: PeriodSpec, filters: FilterSet) -> Result<Self, ValidationError> {
        let entities = entities.into_iter().collect::<BTreeSet<_>>().into_iter().collect::<Vec<_>>();
        if entities.is_empty() {
            return Err(ValidationError::EmptyEntity);
        }
        let signature = QuerySignature::build(entities.iter().map(Entity::as_str), &filters.hash(), &period);
        Ok(Self {
            entities,
            period,
            filters,
            signature,
        })
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn period(&self) -> &PeriodSpec {
        &self.period
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn signature(&self) -> &QuerySignature {
        &self.signature
    }

    pub fn merge_key(&self) -> MergeKey {
        MergeKey(Arc::from(self.filters.canonical()))
    }

    pub fn months(&self) -> Vec<Period> {
        self.period.months()
    }

    /// One concrete account for one month: the shape of almost every formula cell.
    pub fn is_cell(&self) -> bool {
        self.period.is_single() && matches!(self.entities.as_slice(), [Entity::Id(_)])
    }
}

impl Display for NormalizedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signature)
    }
}

/// Validate raw parameters and build their canonical query.
pub fn normalize(params: &EvalParams) -> Result<NormalizedQuery, ValidationError> {
    if params.entity.trim().is_empty() {
        return Err(ValidationError::EmptyEntity);
    }
    let entities = params
        .entity
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(Entity::parse)
        .collect::<Result<Vec<_>, _>>()?;
    let period = PeriodSpec::parse(&params.from_period, params.to_period.as_deref())?;
    let filters = FilterSet::from_params(params)?;

    NormalizedQuery::new(entities, period, filters)
}
