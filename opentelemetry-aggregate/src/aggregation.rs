use std::fmt;

use crate::error::{MetricError, MetricResult};

/// The way recorded measurements are summarized.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Aggregation {
    /// An aggregation that drops all recorded data.
    Drop,

    /// An aggregation that uses the default instrument kind selection mapping to
    /// select another aggregation.
    ///
    /// Counters and up-down counters are summed, gauges keep their last value
    /// and histograms use [`DEFAULT_HISTOGRAM_BOUNDARIES`].
    Default,

    /// An aggregation that summarizes a set of measurements as their arithmetic
    /// sum.
    Sum,

    /// An aggregation that summarizes a set of measurements as the last one made.
    LastValue,

    /// An aggregation that summarizes a set of measurements as a histogram with
    /// explicitly defined buckets.
    ExplicitBucketHistogram {
        /// The increasing bucket boundary values.
        ///
        /// Boundary values define bucket upper bounds. Buckets are exclusive of their
        /// lower boundary and inclusive of their upper bound (except at positive
        /// infinity). Boundaries `[0.0, 5.0, 10.0]` define the buckets:
        ///
        /// (-∞, 0], (0, 5.0], (5.0, 10.0], (10.0, +∞)
        boundaries: Vec<f64>,

        /// Whether the min and max of the distribution are recorded.
        ///
        /// For cumulative data these represent the entire life of the
        /// instrument rather than the current collection cycle.
        record_min_max: bool,
    },
}

/// Boundaries used when a histogram instrument has no explicit aggregation.
pub const DEFAULT_HISTOGRAM_BOUNDARIES: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // used for stream id comparisons
        let name = match self {
            Aggregation::Drop => "Drop",
            Aggregation::Default => "Default",
            Aggregation::Sum => "Sum",
            Aggregation::LastValue => "LastValue",
            Aggregation::ExplicitBucketHistogram { .. } => "ExplicitBucketHistogram",
        };

        f.write_str(name)
    }
}

impl Aggregation {
    /// Validate that this aggregation has correct configuration
    pub fn validate(&self) -> MetricResult<()> {
        match self {
            Aggregation::Drop | Aggregation::Default | Aggregation::Sum | Aggregation::LastValue => {
                Ok(())
            }
            Aggregation::ExplicitBucketHistogram { boundaries, .. } => {
                if boundaries.iter().any(|b| !b.is_finite()) {
                    return Err(MetricError::Config(format!(
                        "aggregation: explicit bucket histogram: non-finite boundary: {boundaries:?}",
                    )));
                }
                for x in boundaries.windows(2) {
                    if x[0] >= x[1] {
                        return Err(MetricError::Config(format!(
                            "aggregation: explicit bucket histogram: non-monotonic boundaries: {boundaries:?}",
                        )));
                    }
                }

                Ok(())
            }
        }
    }
}
