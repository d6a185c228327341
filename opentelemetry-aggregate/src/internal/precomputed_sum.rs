use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use opentelemetry::KeyValue;

use crate::attribute_set::AttributeSet;
use crate::data::{self, AggregatedMetrics, MetricData, SumDataPoint, Temporality};

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::last_value::Assign;
use super::{ComputeAggregation, Measure, Number, ValueMap};

/// Summarizes a set of pre-computed sums as their arithmetic sum.
///
/// Callers report running totals, so the latest observation per attribute
/// set is the cumulative value.
pub(crate) struct PrecomputedSum<T: Number> {
    value_map: ValueMap<Assign<T>>,
    init_time: AggregateTimeInitiator,
    temporality: Temporality,
    filter: AttributeSetFilter,
    monotonic: bool,
    reported: Mutex<HashMap<AttributeSet, T>>,
}

impl<T: Number> PrecomputedSum<T> {
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        monotonic: bool,
    ) -> Self {
        PrecomputedSum {
            value_map: ValueMap::new(()),
            init_time: AggregateTimeInitiator::default(),
            temporality,
            filter,
            monotonic,
            reported: Mutex::new(HashMap::new()),
        }
    }

    /// The change from `prev` to `value`.
    ///
    /// A monotonic total that went down was reset, so the whole new total is
    /// the change. The same applies when the difference does not fit in `T`.
    fn change(&self, prev: T, value: T) -> T {
        if self.monotonic && value < prev {
            return value;
        }
        value.checked_sub_value(prev).unwrap_or(value)
    }

    /// Reports the change of each total since the previous collection.
    ///
    /// Only totals observed this cycle are reported, and only those are
    /// remembered for the next one.
    pub(crate) fn delta(&self) -> data::Sum<T> {
        let time = self.init_time.delta();
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
        let mut new_reported = HashMap::with_capacity(reported.len());

        let mut data_points = Vec::new();
        self.value_map
            .collect_and_reset(&mut data_points, |attributes, Assign(value)| {
                let key = AttributeSet::from(attributes.as_slice());
                let prev_value = reported.get(&key).copied().unwrap_or_default();
                new_reported.insert(key, value);
                SumDataPoint {
                    attributes,
                    value: self.change(prev_value, value),
                }
            });
        *reported = new_reported;

        data::Sum {
            data_points,
            start_time: time.start,
            time: time.current,
            temporality: Temporality::Delta,
            is_monotonic: self.monotonic,
        }
    }

    pub(crate) fn cumulative(&self) -> data::Sum<T> {
        let time = self.init_time.cumulative();
        let mut data_points = Vec::new();
        self.value_map
            .collect_readonly(&mut data_points, |attributes, Assign(value)| {
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

impl<T: Number> Measure<T> for PrecomputedSum<T> {
    fn call(&self, measurement: T, attrs: &[KeyValue]) {
        self.filter.apply(attrs, |filtered| {
            self.value_map.measure(measurement, filtered);
        })
    }
}

impl<T: Number> ComputeAggregation for PrecomputedSum<T> {
    fn call(&self) -> AggregatedMetrics {
        let sum = match self.temporality {
            Temporality::Delta => self.delta(),
            _ => self.cumulative(),
        };
        T::into_aggregated(MetricData::Sum(sum))
    }
}
