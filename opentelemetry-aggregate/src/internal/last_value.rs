use opentelemetry::KeyValue;

use crate::data::{self, AggregatedMetrics, GaugeDataPoint, MetricData, Temporality};

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::{Aggregator, ComputeAggregation, Measure, Number, ValueMap};

/// Latest value of one attribute set.
pub(crate) struct Assign<T>(pub(crate) T);

impl<T: Number> Aggregator for Assign<T> {
    type InitConfig = ();
    type PreComputedValue = T;

    fn create(_init: &(), first: &T) -> Self {
        Assign(*first)
    }

    fn update(&mut self, value: T) {
        self.0 = value;
    }
}

/// Summarizes a set of measurements as the last one made.
pub(crate) struct LastValue<T: Number> {
    value_map: ValueMap<Assign<T>>,
    init_time: AggregateTimeInitiator,
    temporality: Temporality,
    filter: AttributeSetFilter,
}

impl<T: Number> LastValue<T> {
    pub(crate) fn new(temporality: Temporality, filter: AttributeSetFilter) -> Self {
        LastValue {
            value_map: ValueMap::new(()),
            init_time: AggregateTimeInitiator::default(),
            temporality,
            filter,
        }
    }

    pub(crate) fn delta(&self) -> data::Gauge<T> {
        let time = self.init_time.delta();
        let mut data_points = Vec::new();
        self.value_map
            .collect_and_reset(&mut data_points, |attributes, Assign(value)| {
                GaugeDataPoint { attributes, value }
            });

        data::Gauge {
            data_points,
            start_time: Some(time.start),
            time: time.current,
        }
    }

    pub(crate) fn cumulative(&self) -> data::Gauge<T> {
        let time = self.init_time.cumulative();
        let mut data_points = Vec::new();
        self.value_map
            .collect_readonly(&mut data_points, |attributes, Assign(value)| {
                GaugeDataPoint {
                    attributes,
                    value: *value,
                }
            });

        data::Gauge {
            data_points,
            start_time: Some(time.start),
            time: time.current,
        }
    }
}

impl<T: Number> Measure<T> for LastValue<T> {
    fn call(&self, measurement: T, attrs: &[KeyValue]) {
        self.filter.apply(attrs, |filtered| {
            self.value_map.measure(measurement, filtered);
        })
    }
}

impl<T: Number> ComputeAggregation for LastValue<T> {
    fn call(&self) -> AggregatedMetrics {
        let gauge = match self.temporality {
            Temporality::Delta => self.delta(),
            _ => self.cumulative(),
        };
        T::into_aggregated(MetricData::Gauge(gauge))
    }
}
