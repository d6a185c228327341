use opentelemetry::KeyValue;

use crate::data::{self, AggregatedMetrics, MetricData, SumDataPoint, Temporality};

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::{Aggregator, ComputeAggregation, Measure, Number, ValueMap};

/// Running total of one attribute set.
pub(crate) struct Increment<T>(T);

impl<T: Number> Aggregator for Increment<T> {
    type InitConfig = ();
    type PreComputedValue = T;

    fn create(_init: &(), _first: &T) -> Self {
        Increment(T::default())
    }

    fn update(&mut self, value: T) {
        self.0 = self.0.saturating_add_value(value);
    }
}

/// Summarizes a set of measurements made as their arithmetic sum.
pub(crate) struct Sum<T: Number> {
    value_map: ValueMap<Increment<T>>,
    init_time: AggregateTimeInitiator,
    temporality: Temporality,
    filter: AttributeSetFilter,
    monotonic: bool,
}

impl<T: Number> Sum<T> {
    /// Returns an aggregator that summarizes a set of measurements as their
    /// arithmetic sum.
    ///
    /// Each sum is scoped by attributes and the aggregation cycle the
    /// measurements were made in.
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        monotonic: bool,
    ) -> Self {
        Sum {
            value_map: ValueMap::new(()),
            init_time: AggregateTimeInitiator::default(),
            temporality,
            filter,
            monotonic,
        }
    }

    pub(crate) fn delta(&self) -> data::Sum<T> {
        let time = self.init_time.delta();
        let mut data_points = Vec::new();
        self.value_map
            .collect_and_reset(&mut data_points, |attributes, Increment(value)| {
                SumDataPoint { attributes, value }
            });

        data::Sum {
            data_points,
            start_time: time.start,
            time: time.current,
            temporality: Temporality::Delta,
            is_monotonic: self.monotonic,
        }
    }

    /// Attribute sets are never forgotten under cumulative temporality.
    pub(crate) fn cumulative(&self) -> data::Sum<T> {
        let time = self.init_time.cumulative();
        let mut data_points = Vec::new();
        self.value_map
            .collect_readonly(&mut data_points, |attributes, Increment(value)| {
                SumDataPoint {
                    attributes,
                    value: *value,
                }
            });

        data::Sum {
            data_points,
            start_time: time.start,
            time: time.current,
            temporality: Temporality::Cumulative,
            is_monotonic: self.monotonic,
        }
    }
}

impl<T: Number> Measure<T> for Sum<T> {
    fn call(&self, measurement: T, attrs: &[KeyValue]) {
        self.filter.apply(attrs, |filtered| {
            self.value_map.measure(measurement, filtered);
        })
    }
}

impl<T: Number> ComputeAggregation for Sum<T> {
    fn call(&self) -> AggregatedMetrics {
        let sum = match self.temporality {
            Temporality::Delta => self.delta(),
            _ => self.cumulative(),
        };
        T::into_aggregated(MetricData::Sum(sum))
    }
}
