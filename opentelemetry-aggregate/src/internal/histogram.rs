use opentelemetry::KeyValue;

use crate::data::{self, HistogramDataPoint, MetricData, Temporality};

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::{Aggregator, ComputeAggregation, Measure, Number, ValueMap};

/// Bucket counts and statistics of one attribute set.
#[derive(Debug)]
struct Buckets<T> {
    counts: Vec<u64>,
    count: u64,
    total: T,
    min: T,
    max: T,
}

impl<T: Number> Buckets<T> {
    /// Buckets with `n` bins, with `min` and `max` starting at `first`.
    fn new(n: usize, first: T) -> Buckets<T> {
        Buckets {
            counts: vec![0; n],
            count: 0,
            total: T::default(),
            min: first,
            max: first,
        }
    }

    fn bin(&mut self, idx: usize, value: T) {
        self.counts[idx] += 1;
        self.count += 1;
        self.total = self.total.saturating_add_value(value);
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }
}

impl<T: Number> Aggregator for Buckets<T> {
    /// Number of buckets
    type InitConfig = usize;
    /// Value and bucket index
    type PreComputedValue = (T, usize);

    fn create(count: &usize, (first, _): &(T, usize)) -> Self {
        Buckets::new(*count, *first)
    }

    fn update(&mut self, (value, index): (T, usize)) {
        self.bin(index, value);
    }
}

/// Summarizes a set of measurements as a histogram with explicitly defined
/// buckets.
pub(crate) struct Histogram<T: Number> {
    value_map: ValueMap<Buckets<T>>,
    init_time: AggregateTimeInitiator,
    temporality: Temporality,
    filter: AttributeSetFilter,
    bounds: Vec<f64>,
    record_min_max: bool,
    record_sum: bool,
}

impl<T: Number> Histogram<T> {
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        boundaries: &[f64],
        record_min_max: bool,
        record_sum: bool,
    ) -> Self {
        let mut bounds: Vec<f64> = boundaries.iter().copied().filter(|b| !b.is_nan()).collect();
        bounds.sort_by(f64::total_cmp);
        let buckets_count = bounds.len() + 1;

        Histogram {
            value_map: ValueMap::new(buckets_count),
            init_time: AggregateTimeInitiator::default(),
            temporality,
            filter,
            bounds,
            record_min_max,
            record_sum,
        }
    }

    fn bucket_index(&self, value: f64) -> usize {
        // In the range `[0, bounds.len()]`; `bounds.len()` is the overflow
        // bucket `(bounds[bounds.len()-1], +∞)`.
        self.bounds.partition_point(|&b| b < value)
    }

    fn measure(&self, measurement: T, attrs: &[KeyValue]) {
        let f = measurement.into_float();
        if !f.is_finite() {
            return;
        }
        let index = self.bucket_index(f);
        self.value_map.measure((measurement, index), attrs);
    }

    fn data_point(&self, attributes: Vec<KeyValue>, b: &Buckets<T>) -> HistogramDataPoint<T> {
        HistogramDataPoint {
            attributes,
            count: b.count,
            bounds: self.bounds.clone(),
            bucket_counts: b.counts.clone(),
            sum: if self.record_sum {
                b.total
            } else {
                T::default()
            },
            min: self.record_min_max.then_some(b.min),
            max: self.record_min_max.then_some(b.max),
        }
    }

    pub(crate) fn delta(&self) -> data::Histogram<T> {
        let time = self.init_time.delta();
        let mut data_points = Vec::new();
        self.value_map
            .collect_and_reset(&mut data_points, |attributes, b| {
                self.data_point(attributes, &b)
            });

        data::Histogram {
            data_points,
            start_time: time.start,
            time: time.current,
            temporality: Temporality::Delta,
        }
    }

    /// Every attribute set ever measured stays in memory, so a stream with
    /// unbounded attribute cardinality grows without limit under cumulative
    /// temporality.
    pub(crate) fn cumulative(&self) -> data::Histogram<T> {
        let time = self.init_time.cumulative();
        let mut data_points = Vec::new();
        self.value_map
            .collect_readonly(&mut data_points, |attributes, b| {
                self.data_point(attributes, b)
            });

        data::Histogram {
            data_points,
            start_time: time.start,
            time: time.current,
            temporality: Temporality::Cumulative,
        }
    }
}

impl<T: Number> Measure<T> for Histogram<T> {
    fn call(&self, measurement: T, attrs: &[KeyValue]) {
        self.filter.apply(attrs, |filtered| {
            self.measure(measurement, filtered);
        })
    }
}

impl<T: Number> ComputeAggregation for Histogram<T> {
    fn call(&self) -> data::AggregatedMetrics {
        let histogram = match self.temporality {
            Temporality::Delta => self.delta(),
            _ => self.cumulative(),
        };
        T::into_aggregated(MetricData::Histogram(histogram))
    }
}
