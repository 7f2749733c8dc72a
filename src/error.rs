use thiserror::Error;

/// Malformed call parameters. Raised by the normalizer before any cache or registry interaction; never cached,
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("entity is required")]
    EmptyEntity,
    #[error("malformed entity '{0}'")]
    MalformedEntity(String),
    #[error("wildcard pattern '{0}' matches every account")]
    UnboundedPattern(String),
    #[error("period is required")]
    MissingPeriod,
    #[error("malformed period '{0}'")]
    MalformedPeriod(String),
    #[error("period range starts at {from} which is after its end {to}")]
    InvertedRange { from: String, to: String },
    #[error("period range {from}..{to} spans {months} months; at most {max} are allowed")]
    RangeTooLong {
        from:   String,
        to:     String,
        months: u32,
        max:    u32,
    },
    #[error("invalid {name} filter value '{value}'")]
    InvalidFilter { name: &'static str, value: String },
}

/// Failure of the remote ledger service. Permanent for the evaluation attempt that observed it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote service timed out")]
    Timeout,
    #[error("remote service rate limit exceeded")]
    RateLimited,
    #[error("cannot reach remote service: {0}")]
    Connectivity(String),
    #[error("remote service error: {0}")]
    Service(String),
}

/// Persistent tier failures. These are logged and absorbed, they never reach a caller.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistent store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persistent store encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification of an error that reached a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input. Re-evaluating the same parameters fails the same way.
    Validation,
    /// The remote attempt failed. The next host recalculation starts a fresh attempt.
    Remote,
    /// The coordinator could not finish the evaluation at all.
    Internal,
}

/// The only error type crossing the public evaluation boundary.
///
/// It is cheap to clone so that a single outcome can be broadcast to every caller merged into one pending query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalesceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("pending query #{0} was abandoned before it settled")]
    Abandoned(u64),
    #[error("coordinator is shut down")]
    Shutdown,
    #[error("evaluation task failed: {0}")]
    Task(String),
}

impl CoalesceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::Validation,
            Self::Remote(_) | Self::Abandoned(_) => ErrorClass::Remote,
            Self::Shutdown | Self::Task(_) => ErrorClass::Internal,
        }
    }

    #[inline]
    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }
}

pub type Result<T, E = CoalesceError> = std::result::Result<T, E>;
