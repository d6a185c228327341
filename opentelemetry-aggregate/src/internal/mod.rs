mod aggregate;
mod histogram;
mod last_value;
mod precomputed_sum;
mod sum;

use core::fmt;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;
use std::ops::{Add, AddAssign, Sub};
use std::sync::{Mutex, MutexGuard, PoisonError};

use opentelemetry::KeyValue;

use crate::attribute_set::AttributeSet;
use crate::data::{AggregatedMetrics, MetricData};

pub(crate) use aggregate::{AggregateBuilder, AggregateFns, ComputeAggregation, Filter, Measure};

/// Per attribute-set state of one aggregation.
///
/// Trackers are only ever touched while the owning [ValueMap] lock is held, so
/// they are plain mutable values with no synchronization of their own.
pub(crate) trait Aggregator: Send + Sync + 'static {
    /// Configuration shared by every tracker of one aggregation, e.g. the number
    /// of histogram buckets.
    type InitConfig: Send + Sync + 'static;

    /// The measurement after any aggregation specific pre-processing, e.g. a
    /// value paired with its histogram bucket index.
    type PreComputedValue: Copy;

    /// Called the first time an attribute set is seen, with the measurement
    /// that caused it. The same measurement is then passed to `update`.
    fn create(init: &Self::InitConfig, first: &Self::PreComputedValue) -> Self;

    /// Called for each measurement.
    fn update(&mut self, value: Self::PreComputedValue);
}

/// The storage for aggregations of one instrument stream.
///
/// A single mutex guards both the map structure and every tracker in it. This
/// keeps one measurement atomic with respect to a collection and makes a
/// collection a consistent snapshot of all measurements that completed before
/// it.
pub(crate) struct ValueMap<A: Aggregator> {
    trackers: Mutex<HashMap<AttributeSet, A>>,
    config: A::InitConfig,
}

impl<A: Aggregator> ValueMap<A> {
    pub(crate) fn new(config: A::InitConfig) -> Self {
        ValueMap {
            trackers: Mutex::new(HashMap::new()),
            config,
        }
    }

    // The data behind the lock is a set of counters which are always left in
    // a valid state, so a panic on another thread is not a reason to stop
    // aggregating.
    fn lock(&self) -> MutexGuard<'_, HashMap<AttributeSet, A>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn measure(&self, value: A::PreComputedValue, attributes: &[KeyValue]) {
        let attributes = AttributeSet::from(attributes);

        let mut trackers = self.lock();
        match trackers.entry(attributes) {
            Entry::Occupied(entry) => entry.into_mut().update(value),
            Entry::Vacant(entry) => {
                let tracker = entry.insert(A::create(&self.config, &value));
                tracker.update(value);
            }
        }
    }

    /// Number of attribute sets currently tracked.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Moves every tracker out of the map and maps it into a data point.
    ///
    /// The map is swapped for an empty one while locked; building the data
    /// points happens after the lock is released. Attribute sets that are not
    /// measured again will not be reported again.
    pub(crate) fn collect_and_reset<DP, MapFn>(&self, dest: &mut Vec<DP>, mut map_fn: MapFn)
    where
        MapFn: FnMut(Vec<KeyValue>, A) -> DP,
    {
        let drained = mem::take(&mut *self.lock());
        dest.reserve(drained.len());
        dest.extend(
            drained
                .into_iter()
                .map(|(attributes, tracker)| map_fn(attributes.into_vec(), tracker)),
        );
    }

    /// Maps every tracker into a data point, leaving the trackers in place.
    ///
    /// `map_fn` runs under the lock and must copy anything it keeps out of the
    /// tracker.
    pub(crate) fn collect_readonly<DP, MapFn>(&self, dest: &mut Vec<DP>, mut map_fn: MapFn)
    where
        MapFn: FnMut(Vec<KeyValue>, &A) -> DP,
    {
        let trackers = self.lock();
        dest.reserve(trackers.len());
        dest.extend(
            trackers
                .iter()
                .map(|(attributes, tracker)| map_fn(attributes.to_vec(), tracker)),
        );
    }
}

/// The numeric types measurements can be recorded with: `i64`, `u64` and `f64`.
///
/// Every aggregation is implemented once over this trait, so the hot path never
/// switches on the number type at runtime.
pub trait Number:
    Add<Output = Self>
    + AddAssign
    + Sub<Output = Self>
    + PartialOrd
    + fmt::Debug
    + Clone
    + Copy
    + PartialEq
    + Default
    + Send
    + Sync
    + 'static
    + IntoAggregatedMetrics
{
    /// Converts the value for comparison against histogram boundaries.
    fn into_float(self) -> f64;

    /// Name of the number type, used to tell streams of different types apart.
    fn type_name() -> &'static str;

    /// Addition that saturates at the bounds of integer types instead of
    /// overflowing.
    fn saturating_add_value(self, rhs: Self) -> Self;

    /// `self - rhs`, or `None` if the result is not representable.
    fn checked_sub_value(self, rhs: Self) -> Option<Self>;
}

/// Wraps typed metric data into the type-erased form handed to exporters.
#[doc(hidden)]
pub trait IntoAggregatedMetrics: Sized {
    /// Wraps `data` into the matching [AggregatedMetrics] variant.
    fn into_aggregated(data: MetricData<Self>) -> AggregatedMetrics;
}

impl<T> IntoAggregatedMetrics for T
where
    AggregatedMetrics: From<MetricData<T>>,
{
    fn into_aggregated(data: MetricData<Self>) -> AggregatedMetrics {
        data.into()
    }
}

impl Number for i64 {
    fn into_float(self) -> f64 {
        // May have precision loss at high values
        self as f64
    }

    fn type_name() -> &'static str {
        "i64"
    }

    fn saturating_add_value(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }

    fn checked_sub_value(self, rhs: Self) -> Option<Self> {
        self.checked_sub(rhs)
    }
}

impl Number for u64 {
    fn into_float(self) -> f64 {
        // May have precision loss at high values
        self as f64
    }

    fn type_name() -> &'static str {
        "u64"
    }

    fn saturating_add_value(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }

    fn checked_sub_value(self, rhs: Self) -> Option<Self> {
        self.checked_sub(rhs)
    }
}

impl Number for f64 {
    fn into_float(self) -> f64 {
        self
    }

    fn type_name() -> &'static str {
        "f64"
    }

    fn saturating_add_value(self, rhs: Self) -> Self {
        self + rhs
    }

    fn checked_sub_value(self, rhs: Self) -> Option<Self> {
        Some(self - rhs)
    }
}
