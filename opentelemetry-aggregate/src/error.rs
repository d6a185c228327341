use std::result;
use std::sync::PoisonError;
use thiserror::Error;

/// A specialized `Result` type for metric operations.
pub type MetricResult<T> = result::Result<T, MetricError>;

/// Errors returned when configuring aggregations or registering instruments.
///
/// Recording a measurement never fails; errors are only surfaced at the
/// registration boundary.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum MetricError {
    /// Other errors not covered by specific cases.
    #[error("Metrics error: {0}")]
    Other(String),
    /// Invalid configuration
    #[error("Config error {0}")]
    Config(String),
    /// The observable has no aggregators and would be a no-op.
    #[error("no aggregators for observable instrument")]
    NoAggregators,
    /// The observable was registered with a scope other than the one it was
    /// created with.
    #[error(
        "invalid registration: observable {name:?} from Meter {created:?}, registered with Meter {registered:?}"
    )]
    InvalidRegistration {
        /// Name of the observable instrument.
        name: String,
        /// Name of the scope the observable was created with.
        created: String,
        /// Name of the scope the registration was attempted with.
        registered: String,
    },
}

impl<T> From<PoisonError<T>> for MetricError {
    fn from(err: PoisonError<T>) -> Self {
        MetricError::Other(err.to_string())
    }
}
