use core::fmt;
use std::{
    any::Any,
    borrow::Cow,
    collections::{HashMap, HashSet},
    env,
    sync::{Arc, Mutex},
};

use opentelemetry::{otel_debug, otel_warn, InstrumentationScope};

use crate::{
    aggregation::{Aggregation, DEFAULT_HISTOGRAM_BOUNDARIES},
    data::{Metric, ScopeMetrics, Temporality},
    error::{MetricError, MetricResult},
    instrument::{
        Instrument, InstrumentKind, Observable, Registerable, ResolvedMeasures, Stream, StreamId,
    },
    internal::{self, AggregateBuilder, AggregateFns, Number},
    view::View,
};

/// The environment variable holding the temporality preference of a
/// [PipelineBuilder]: `cumulative`, `delta` or `lowmemory`.
pub const OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE: &str =
    "OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE";

/// Configuration for a [Pipeline].
///
/// The temporality preference is read from
/// [`OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE`] when the builder is
/// created. An unknown value is logged and cumulative is used instead.
/// [`with_temporality`](Self::with_temporality) takes precedence over the
/// environment.
///
/// # Example
///
/// ```
/// use opentelemetry_aggregate::{PipelineBuilder, Temporality};
///
/// let pipeline = PipelineBuilder::default()
///     .with_temporality(Temporality::Delta)
///     .build();
/// # drop(pipeline);
/// ```
pub struct PipelineBuilder {
    views: Vec<Arc<dyn View>>,
    temporality: Temporality,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        let temporality = match env::var(OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE) {
            Ok(value) => value.parse().unwrap_or_else(|err: MetricError| {
                otel_warn!(
                    name: "PipelineBuilder.InvalidTemporalityPreference",
                    message = "Invalid temporality preference in environment, falling back to cumulative",
                    value = value.as_str(),
                    error = err.to_string(),
                );
                Temporality::Cumulative
            }),
            Err(_) => Temporality::Cumulative,
        };
        PipelineBuilder {
            views: Vec::new(),
            temporality,
        }
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("views", &self.views.len())
            .field("temporality", &self.temporality)
            .finish()
    }
}

impl PipelineBuilder {
    /// Associates a [View] with the pipeline.
    ///
    /// Views are matched in the order they are added. When no view matches an
    /// instrument, the instrument is aggregated with its default aggregation.
    pub fn with_view<T: View>(mut self, view: T) -> Self {
        self.views.push(Arc::new(view));
        self
    }

    /// Sets the temporality preference, overriding the environment.
    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.temporality = temporality;
        self
    }

    /// Creates the [Pipeline].
    pub fn build(self) -> Pipeline {
        otel_debug!(
            name: "Pipeline.Building",
            builder = format!("{:?}", &self),
        );
        Pipeline {
            views: self.views,
            temporality: self.temporality,
            inner: Mutex::new(PipelineInner::default()),
            aggregators: Mutex::new(HashMap::new()),
            stream_ids: Mutex::new(HashMap::new()),
        }
    }
}

/// Single or multi-instrument callbacks
type GenericCallback = Arc<dyn Fn() + Send + Sync>;

/// Aggregator inputs keyed by scope and stream, holding an
/// `Option<Arc<dyn Measure<T>>>` for the number type named in the stream id.
type Cache = HashMap<(InstrumentationScope, StreamId), Arc<dyn Any + Send + Sync>>;

#[derive(Default)]
struct PipelineInner {
    aggregations: HashMap<InstrumentationScope, Vec<InstrumentSync>>,
    callbacks: Vec<GenericCallback>,
}

impl fmt::Debug for PipelineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineInner")
            .field("aggregations", &self.aggregations)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// A synchronization point between a [Pipeline] and an instrument's aggregate function.
struct InstrumentSync {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    kind: InstrumentKind,
    comp_agg: Arc<dyn internal::ComputeAggregation>,
}

impl fmt::Debug for InstrumentSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSync")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("unit", &self.unit)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Connects instruments to the aggregators their measurements are recorded
/// into, and collects those aggregators.
///
/// As instruments are created they are matched against the views of the
/// pipeline, and each aggregate function a matching view asks for is added to
/// the pipeline.
pub struct Pipeline {
    views: Vec<Arc<dyn View>>,
    temporality: Temporality,
    inner: Mutex<PipelineInner>,
    aggregators: Mutex<Cache>,
    /// The first stream id seen for each normalized stream name.
    stream_ids: Mutex<HashMap<String, StreamId>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("views", &self.views.len())
            .field("temporality", &self.temporality)
            .finish()
    }
}

impl Pipeline {
    /// Creates a [PipelineBuilder].
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Resolves the aggregators a synchronous instrument records into.
    ///
    /// Every view matching `inst` contributes an aggregator, de-duplicated by
    /// stream identity. Resolving the same stream again returns the same
    /// aggregator. Fails if `inst` has no kind or a view selects an
    /// aggregation incompatible with it.
    pub fn instrument<T: Number>(&self, inst: Instrument) -> MetricResult<ResolvedMeasures<T>> {
        let measures = self.measures(&inst)?;
        if measures.is_empty() {
            otel_debug!(
                name: "Pipeline.InstrumentDropped",
                instrument_name = inst.name(),
                message = "Every matching view drops this instrument",
            );
        }
        Ok(ResolvedMeasures { measures })
    }

    /// Creates an asynchronous instrument, observed from callbacks registered
    /// with [`register_callback`](Self::register_callback).
    pub fn observable<T: Number>(&self, inst: Instrument) -> MetricResult<Observable<T>> {
        let kind = match inst.kind {
            Some(
                kind @ (InstrumentKind::ObservableCounter
                | InstrumentKind::ObservableUpDownCounter
                | InstrumentKind::ObservableGauge),
            ) => kind,
            other => {
                return Err(MetricError::Other(format!(
                    "observable instrument {:?} must have an observable kind, got {other:?}",
                    inst.name
                )))
            }
        };
        let measures = self.measures(&inst)?;
        Ok(Observable::new(&inst, kind, measures))
    }

    /// Registers `callback` to run at the start of every [`collect`](Self::collect).
    ///
    /// Observables without aggregators are skipped. The callback is not
    /// registered if none remain, and an error is returned if any observable
    /// was created with a scope other than `scope`.
    pub fn register_callback<F>(
        &self,
        scope: &InstrumentationScope,
        instruments: &[&dyn Registerable],
        callback: F,
    ) -> MetricResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registerable = 0;
        for inst in instruments {
            match inst.registerable(scope) {
                Ok(()) => registerable += 1,
                Err(MetricError::NoAggregators) => continue,
                Err(err) => return Err(err),
            }
        }
        if registerable == 0 {
            otel_debug!(
                name: "Pipeline.CallbackNotRegistered",
                message = "No observable with aggregators; callback is not registered",
            );
            return Ok(());
        }

        self.inner.lock()?.callbacks.push(Arc::new(callback));
        Ok(())
    }

    /// Runs the registered callbacks and collects every aggregator.
    ///
    /// The result is grouped by instrumentation scope. Aggregations without
    /// data points and scopes without metrics are left out.
    pub fn collect(&self) -> MetricResult<Vec<ScopeMetrics>> {
        let callbacks = self.inner.lock()?.callbacks.clone();
        otel_debug!(
            name: "Pipeline.InvokingObservableCallbacks",
            count = callbacks.len(),
        );
        for cb in &callbacks {
            cb();
        }

        let inner = self.inner.lock()?;
        let mut scope_metrics = Vec::with_capacity(inner.aggregations.len());
        for (scope, instruments) in inner.aggregations.iter() {
            let metrics: Vec<Metric> = instruments
                .iter()
                .filter_map(|inst| {
                    let data = inst.comp_agg.call();
                    (!data.is_empty()).then(|| Metric {
                        name: inst.name.clone(),
                        description: inst.description.clone(),
                        unit: inst.unit.clone(),
                        kind: inst.kind,
                        data,
                    })
                })
                .collect();

            if !metrics.is_empty() {
                scope_metrics.push(ScopeMetrics {
                    scope: scope.clone(),
                    metrics,
                });
            }
        }

        Ok(scope_metrics)
    }

    fn measures<T: Number>(
        &self,
        inst: &Instrument,
    ) -> MetricResult<Vec<Arc<dyn internal::Measure<T>>>> {
        let kind = match inst.kind {
            Some(kind) => kind,
            None => return Err(MetricError::Other("instrument must have a kind".into())),
        };

        let mut matched = false;
        let mut measures = vec![];
        let mut errs = vec![];

        // The cache returns the same aggregator for the same stream. Use stream
        // ids to de-duplicate.
        let mut seen = HashSet::new();
        for v in &self.views {
            let stream = match v.match_inst(inst) {
                Some(stream) => stream,
                None => continue,
            };
            matched = true;

            let stream = resolve_stream(inst, stream);
            let mut id = self.stream_id::<T>(kind, &stream);
            id.normalize();
            if seen.contains(&id) {
                continue; // This aggregator has already been added
            }

            match self.cached_aggregator::<T>(&inst.scope, kind, stream) {
                Ok(Some(agg)) => measures.push(agg),
                Ok(None) => {} // Drop aggregator.
                Err(err) => errs.push(err),
            }
            seen.insert(id);
        }

        if !matched {
            // Apply implicit default view if no explicit matched.
            let stream = resolve_stream(inst, Stream::default());
            match self.cached_aggregator::<T>(&inst.scope, kind, stream) {
                Ok(Some(agg)) => measures.push(agg),
                Ok(None) => {}
                Err(err) => errs.push(err),
            }
        }

        if errs.is_empty() {
            Ok(measures)
        } else {
            Err(MetricError::Other(format!("{errs:?}")))
        }
    }

    /// Returns the aggregate function input for a stream.
    ///
    /// If the stream has already been resolved in this scope, the same
    /// aggregator is returned. Otherwise a new one is created and its output is
    /// added to the pipeline.
    ///
    /// If the stream conflicts with one already created under the same name
    /// (e.g. description, unit, number type) a debug event is logged and a new
    /// aggregator is still returned.
    fn cached_aggregator<T: Number>(
        &self,
        scope: &InstrumentationScope,
        kind: InstrumentKind,
        mut stream: Stream,
    ) -> MetricResult<Option<Arc<dyn internal::Measure<T>>>> {
        let mut id = self.stream_id::<T>(kind, &stream);
        let agg = match stream.aggregation.take() {
            None | Some(Aggregation::Default) => default_aggregation_selector(kind),
            Some(agg) => agg,
        };

        if let Err(err) = is_aggregator_compatible(&kind, &agg) {
            return Err(MetricError::Other(format!(
                "creating aggregator with instrumentKind: {kind:?}, aggregation {agg:?}: {err}",
            )));
        }

        // Requests for the same stream with different name casing get the
        // first-seen aggregator.
        id.normalize();

        // A conflicting stream is still created, the conflict is only logged.
        self.log_conflict(&id);

        let mut cache = self.aggregators.lock()?;
        let key = (scope.clone(), id);
        if let Some(cached) = cache.get(&key) {
            return cached
                .downcast_ref::<Option<Arc<dyn internal::Measure<T>>>>()
                .cloned()
                .ok_or_else(|| {
                    MetricError::Other("cached aggregator has a different number type".into())
                });
        }

        let temporality = kind.temporality_preference(self.temporality);
        let b = AggregateBuilder::new(temporality, stream.attribute_filter());
        let measure = match aggregate_fn(b, &agg, kind)? {
            Some(AggregateFns { measure, collect }) => {
                self.add_sync(
                    scope.clone(),
                    InstrumentSync {
                        name: stream.name.unwrap_or_default(),
                        description: stream.description.unwrap_or_default(),
                        unit: stream.unit.unwrap_or_default(),
                        kind,
                        comp_agg: collect,
                    },
                )?;
                Some(measure)
            }
            None => None,
        };

        cache.insert(key, Arc::new(measure.clone()));
        Ok(measure)
    }

    /// Adds the [InstrumentSync] to pipeline with scope.
    fn add_sync(&self, scope: InstrumentationScope, i_sync: InstrumentSync) -> MetricResult<()> {
        let mut inner = self.inner.lock()?;
        otel_debug!(
            name: "InstrumentCreated",
            instrument_name = i_sync.name.as_ref(),
        );
        inner.aggregations.entry(scope).or_default().push(i_sync);
        Ok(())
    }

    /// Validates if a stream with the same name as id has already been created.
    ///
    /// If that stream conflicts with id, a debug event is logged.
    fn log_conflict(&self, id: &StreamId) {
        let Ok(mut ids) = self.stream_ids.lock() else {
            return;
        };
        let existing = ids.entry(id.name.to_string()).or_insert_with(|| id.clone());
        if *existing == *id {
            return;
        }
        otel_debug!(
            name: "Instrument.DuplicateMetricStreamDefinitions",
            message = "duplicate metric stream definitions",
            reason = format!("names: ({} and {}), descriptions: ({} and {}), aggregations: ({} and {}), units: ({:?} and {:?}), and numbers: ({} and {})",
                existing.name, id.name,
                existing.description, id.description,
                existing.aggregation, id.aggregation,
                existing.unit, id.unit,
                existing.number, id.number,)
        );
    }

    fn stream_id<T: Number>(&self, kind: InstrumentKind, stream: &Stream) -> StreamId {
        let aggregation = match &stream.aggregation {
            None | Some(Aggregation::Default) => default_aggregation_selector(kind),
            Some(agg) => agg.clone(),
        };
        let temporality = match aggregation {
            Aggregation::Drop => None,
            _ => Some(kind.temporality_preference(self.temporality)),
        };
        StreamId {
            name: stream.name.clone().unwrap_or_default(),
            description: stream.description.clone().unwrap_or_default(),
            unit: stream.unit.clone().unwrap_or_default(),
            monotonic: matches!(aggregation, Aggregation::Sum) && kind.is_monotonic(),
            aggregation: aggregation.to_string(),
            temporality,
            number: Cow::Borrowed(T::type_name()),
        }
    }
}

/// Fills the unset name, description and unit of `stream` from `inst`.
fn resolve_stream(inst: &Instrument, stream: Stream) -> Stream {
    Stream {
        name: stream.name.or_else(|| Some(inst.name.clone())),
        description: stream.description.or_else(|| Some(inst.description.clone())),
        unit: stream.unit.or_else(|| Some(inst.unit.clone())),
        ..stream
    }
}

/// The default aggregation and parameters for an instrument of [InstrumentKind].
///
/// This aggregation selector uses the following selection mapping:
///
/// * Counter ⇨ Sum
/// * Observable Counter ⇨ Sum
/// * UpDownCounter ⇨ Sum
/// * Observable UpDownCounter ⇨ Sum
/// * Gauge ⇨ LastValue
/// * Observable Gauge ⇨ LastValue
/// * Histogram ⇨ ExplicitBucketHistogram
fn default_aggregation_selector(kind: InstrumentKind) -> Aggregation {
    match kind {
        InstrumentKind::Counter
        | InstrumentKind::UpDownCounter
        | InstrumentKind::ObservableCounter
        | InstrumentKind::ObservableUpDownCounter => Aggregation::Sum,
        InstrumentKind::Gauge | InstrumentKind::ObservableGauge => Aggregation::LastValue,
        InstrumentKind::Histogram => Aggregation::ExplicitBucketHistogram {
            boundaries: DEFAULT_HISTOGRAM_BOUNDARIES.to_vec(),
            record_min_max: true,
        },
    }
}

/// Returns new aggregate functions for the given params.
///
/// Returns `None` for [Aggregation::Drop].
fn aggregate_fn<T: Number>(
    b: AggregateBuilder<T>,
    agg: &Aggregation,
    kind: InstrumentKind,
) -> MetricResult<Option<AggregateFns<T>>> {
    match agg {
        Aggregation::Default => aggregate_fn(b, &default_aggregation_selector(kind), kind),
        Aggregation::Drop => Ok(None),
        Aggregation::LastValue => match kind {
            InstrumentKind::Gauge => Ok(Some(b.last_value(None))),
            // Observable gauges only report what was observed since the
            // previous collection.
            InstrumentKind::ObservableGauge => Ok(Some(b.last_value(Some(Temporality::Delta)))),
            _ => Err(MetricError::Other(format!(
                "LastValue aggregation is only available for Gauge or ObservableGauge, but not for {kind:?}"
            ))),
        },
        Aggregation::Sum => {
            let fns = match kind {
                InstrumentKind::ObservableCounter => b.precomputed_sum(true),
                InstrumentKind::ObservableUpDownCounter => b.precomputed_sum(false),
                InstrumentKind::Counter | InstrumentKind::Histogram => b.sum(true),
                _ => b.sum(false),
            };
            Ok(Some(fns))
        }
        Aggregation::ExplicitBucketHistogram {
            boundaries,
            record_min_max,
        } => {
            let record_sum = !matches!(
                kind,
                InstrumentKind::UpDownCounter
                    | InstrumentKind::ObservableUpDownCounter
                    | InstrumentKind::ObservableGauge
            );
            Ok(Some(b.explicit_bucket_histogram(
                boundaries,
                *record_min_max,
                record_sum,
            )))
        }
    }
}

/// Checks if the aggregation can be used by the instrument.
///
/// Current compatibility:
///
/// | Instrument Kind          | Drop | LastValue | Sum | Histogram |
/// |--------------------------|------|-----------|-----|-----------|
/// | Counter                  | ✓    |           | ✓   | ✓         |
/// | UpDownCounter            | ✓    |           | ✓   | ✓         |
/// | Histogram                | ✓    |           | ✓   | ✓         |
/// | Observable Counter       | ✓    |           | ✓   | ✓         |
/// | Observable UpDownCounter | ✓    |           | ✓   | ✓         |
/// | Gauge                    | ✓    | ✓         |     | ✓         |
/// | Observable Gauge         | ✓    | ✓         |     | ✓         |
fn is_aggregator_compatible(kind: &InstrumentKind, agg: &Aggregation) -> MetricResult<()> {
    match agg {
        Aggregation::Default | Aggregation::Drop | Aggregation::ExplicitBucketHistogram { .. } => {
            Ok(())
        }
        Aggregation::Sum => match kind {
            InstrumentKind::ObservableCounter
            | InstrumentKind::ObservableUpDownCounter
            | InstrumentKind::Counter
            | InstrumentKind::Histogram
            | InstrumentKind::UpDownCounter => Ok(()),
            _ => Err(MetricError::Other("incompatible aggregation".into())),
        },
        Aggregation::LastValue => match kind {
            InstrumentKind::Gauge | InstrumentKind::ObservableGauge => Ok(()),
            _ => Err(MetricError::Other("incompatible aggregation".into())),
        },
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::{Key, KeyValue};
    use rstest::rstest;

    use crate::{
        context::Context,
        data::{AggregatedMetrics, MetricData},
        view::new_view,
    };

    use super::*;

    fn scope(name: &'static str) -> InstrumentationScope {
        InstrumentationScope::builder(name).build()
    }

    fn inst(name: &'static str, kind: InstrumentKind) -> Instrument {
        Instrument::new()
            .with_name(name)
            .with_kind(kind)
            .with_scope(scope("test"))
    }

    fn pipeline() -> Pipeline {
        PipelineBuilder::default()
            .with_temporality(Temporality::Cumulative)
            .build()
    }

    fn only_metric(collected: &[ScopeMetrics]) -> &Metric {
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].metrics.len(), 1);
        &collected[0].metrics[0]
    }

    #[rstest]
    #[case(InstrumentKind::Counter, "Sum")]
    #[case(InstrumentKind::UpDownCounter, "Sum")]
    #[case(InstrumentKind::ObservableCounter, "Sum")]
    #[case(InstrumentKind::ObservableUpDownCounter, "Sum")]
    #[case(InstrumentKind::Gauge, "LastValue")]
    #[case(InstrumentKind::ObservableGauge, "LastValue")]
    #[case(InstrumentKind::Histogram, "ExplicitBucketHistogram")]
    fn default_aggregation(#[case] kind: InstrumentKind, #[case] expected: &str) {
        let agg = default_aggregation_selector(kind);
        assert_eq!(agg.to_string(), expected);
        assert!(is_aggregator_compatible(&kind, &agg).is_ok());
    }

    #[rstest]
    #[case(InstrumentKind::Gauge, Aggregation::Sum)]
    #[case(InstrumentKind::ObservableGauge, Aggregation::Sum)]
    #[case(InstrumentKind::Counter, Aggregation::LastValue)]
    #[case(InstrumentKind::Histogram, Aggregation::LastValue)]
    fn incompatible_aggregations(#[case] kind: InstrumentKind, #[case] agg: Aggregation) {
        assert!(is_aggregator_compatible(&kind, &agg).is_err());
    }

    #[test]
    fn incompatible_view_is_an_error() {
        let view = new_view(
            Instrument::new().with_name("temperature"),
            Stream::builder()
                .with_aggregation(Aggregation::Sum)
                .build()
                .unwrap(),
        )
        .unwrap();
        let p = PipelineBuilder::default().with_view(view).build();
        assert!(p
            .instrument::<f64>(inst("temperature", InstrumentKind::Gauge))
            .is_err());
    }

    #[test]
    fn instrument_without_kind_is_an_error() {
        let p = pipeline();
        assert!(p.instrument::<u64>(Instrument::new().with_name("x")).is_err());
    }

    #[test]
    fn default_histogram_uses_default_boundaries() {
        let p = pipeline();
        let h = p
            .instrument::<f64>(inst("latency", InstrumentKind::Histogram))
            .unwrap();
        h.measure(&Context::new(), 7.0, &[]);

        let collected = p.collect().unwrap();
        let metric = only_metric(&collected);
        let AggregatedMetrics::F64(MetricData::Histogram(hist)) = &metric.data else {
            panic!("expected f64 histogram, got {:?}", metric.data);
        };
        let dp = &hist.data_points[0];
        assert_eq!(dp.bounds, DEFAULT_HISTOGRAM_BOUNDARIES.to_vec());
        assert_eq!(dp.bucket_counts.len(), DEFAULT_HISTOGRAM_BOUNDARIES.len() + 1);
        assert_eq!(dp.bucket_counts[2], 1);
    }

    #[test]
    fn same_stream_resolves_to_same_aggregator() {
        let p = pipeline();
        let a = p
            .instrument::<u64>(inst("requests", InstrumentKind::Counter))
            .unwrap();
        let b = p
            .instrument::<u64>(inst("Requests", InstrumentKind::Counter))
            .unwrap();
        a.measure(&Context::new(), 1, &[]);
        b.measure(&Context::new(), 2, &[]);

        let collected = p.collect().unwrap();
        let metric = only_metric(&collected);
        assert_eq!(metric.name, "requests");
        let AggregatedMetrics::U64(MetricData::Sum(sum)) = &metric.data else {
            panic!("expected u64 sum");
        };
        assert_eq!(sum.data_points[0].value, 3);
    }

    #[test]
    fn views_differing_only_in_name_case_share_one_aggregator() {
        let p = PipelineBuilder::default()
            .with_view(|_: &Instrument| Stream::builder().with_name("Requests").build().ok())
            .with_view(|_: &Instrument| Stream::builder().with_name("requests").build().ok())
            .build();
        let counter = p
            .instrument::<u64>(inst("requests", InstrumentKind::Counter))
            .unwrap();
        assert_eq!(counter.measures.len(), 1);

        counter.measure(&Context::new(), 1, &[]);
        let collected = p.collect().unwrap();
        let metric = only_metric(&collected);
        let AggregatedMetrics::U64(MetricData::Sum(sum)) = &metric.data else {
            panic!("expected u64 sum");
        };
        assert_eq!(sum.data_points[0].value, 1);
    }

    #[test]
    fn name_case_is_not_a_stream_conflict() {
        let p = pipeline();
        p.instrument::<u64>(inst("Requests", InstrumentKind::Counter)).unwrap();
        p.instrument::<u64>(inst("REQUESTS", InstrumentKind::Counter)).unwrap();

        let ids = p.stream_ids.lock().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids["requests"].name, "requests");
    }

    #[test]
    fn duplicate_views_are_deduplicated() {
        let p = PipelineBuilder::default()
            .with_view(|_: &Instrument| Some(Stream::default()))
            .with_view(|_: &Instrument| Some(Stream::default()))
            .build();
        let counter = p
            .instrument::<i64>(inst("requests", InstrumentKind::UpDownCounter))
            .unwrap();
        assert_eq!(counter.measures.len(), 1);
    }

    #[test]
    fn views_can_rename_drop_and_filter() {
        let rename = new_view(
            Instrument::new().with_name("requests"),
            Stream::builder()
                .with_name("requests.by_method")
                .with_allowed_attribute_keys([Key::new("method")])
                .build()
                .unwrap(),
        )
        .unwrap();
        let drop = new_view(
            Instrument::new().with_name("noisy"),
            Stream::builder()
                .with_aggregation(Aggregation::Drop)
                .build()
                .unwrap(),
        )
        .unwrap();
        let p = PipelineBuilder::default()
            .with_view(rename)
            .with_view(drop)
            .build();

        let requests = p
            .instrument::<u64>(inst("requests", InstrumentKind::Counter))
            .unwrap();
        let noisy = p
            .instrument::<u64>(inst("noisy", InstrumentKind::Counter))
            .unwrap();
        assert!(noisy.is_empty());

        let cx = Context::new();
        requests.measure(&cx, 1, &[KeyValue::new("method", "GET"), KeyValue::new("id", 1_i64)]);
        requests.measure(&cx, 1, &[KeyValue::new("method", "GET"), KeyValue::new("id", 2_i64)]);
        noisy.measure(&cx, 5, &[]);

        let collected = p.collect().unwrap();
        let metric = only_metric(&collected);
        assert_eq!(metric.name, "requests.by_method");
        let AggregatedMetrics::U64(MetricData::Sum(sum)) = &metric.data else {
            panic!("expected u64 sum");
        };
        assert_eq!(sum.data_points.len(), 1);
        assert_eq!(sum.data_points[0].attributes, vec![KeyValue::new("method", "GET")]);
        assert_eq!(sum.data_points[0].value, 2);
    }

    #[test]
    fn empty_aggregations_are_not_collected() {
        let p = pipeline();
        let _counter = p
            .instrument::<u64>(inst("idle", InstrumentKind::Counter))
            .unwrap();
        assert!(p.collect().unwrap().is_empty());
    }

    #[test]
    fn collect_groups_by_scope() {
        let p = pipeline();
        let a = p
            .instrument::<u64>(
                Instrument::new()
                    .with_name("a")
                    .with_kind(InstrumentKind::Counter)
                    .with_scope(scope("first")),
            )
            .unwrap();
        let b = p
            .instrument::<u64>(
                Instrument::new()
                    .with_name("b")
                    .with_kind(InstrumentKind::Counter)
                    .with_scope(scope("second")),
            )
            .unwrap();
        a.measure(&Context::new(), 1, &[]);
        b.measure(&Context::new(), 1, &[]);

        let mut names: Vec<_> = p
            .collect()
            .unwrap()
            .into_iter()
            .map(|sm| (sm.scope.name().to_string(), sm.metrics[0].name.to_string()))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("first".to_string(), "a".to_string()),
                ("second".to_string(), "b".to_string())
            ]
        );
    }

    #[test]
    fn delta_preference_resets_counters() {
        let p = PipelineBuilder::default()
            .with_temporality(Temporality::Delta)
            .build();
        let counter = p
            .instrument::<u64>(inst("requests", InstrumentKind::Counter))
            .unwrap();
        counter.measure(&Context::new(), 4, &[]);

        let collected = p.collect().unwrap();
        let AggregatedMetrics::U64(MetricData::Sum(sum)) = &only_metric(&collected).data else {
            panic!("expected u64 sum");
        };
        assert_eq!(sum.temporality, Temporality::Delta);
        assert!(p.collect().unwrap().is_empty());
    }

    #[test]
    fn callbacks_run_before_collection() {
        let p = pipeline();
        let observable = p
            .observable::<u64>(inst("cpu.time", InstrumentKind::ObservableCounter))
            .unwrap();
        let observer = observable.clone();
        p.register_callback(&scope("test"), &[&observable], move || {
            observer.observe(42, &[KeyValue::new("cpu", 0_i64)]);
        })
        .unwrap();

        let collected = p.collect().unwrap();
        let metric = only_metric(&collected);
        assert_eq!(metric.kind, InstrumentKind::ObservableCounter);
        let AggregatedMetrics::U64(MetricData::Sum(sum)) = &metric.data else {
            panic!("expected u64 sum");
        };
        assert!(sum.is_monotonic);
        assert_eq!(sum.data_points[0].value, 42);
    }

    #[test]
    fn callback_registration_is_guarded() {
        let p = pipeline();
        let observable = p
            .observable::<f64>(inst("temp", InstrumentKind::ObservableGauge))
            .unwrap();

        let err = p
            .register_callback(&scope("elsewhere"), &[&observable], || {})
            .unwrap_err();
        assert!(matches!(err, MetricError::InvalidRegistration { .. }));

        let dropped = PipelineBuilder::default()
            .with_view(|_: &Instrument| {
                Stream::builder().with_aggregation(Aggregation::Drop).build().ok()
            })
            .build();
        let no_aggregators = dropped
            .observable::<f64>(inst("temp", InstrumentKind::ObservableGauge))
            .unwrap();
        assert!(dropped
            .register_callback(&scope("test"), &[&no_aggregators], || panic!("not registered"))
            .is_ok());
        assert!(dropped.collect().unwrap().is_empty());
    }

    #[test]
    fn observable_requires_observable_kind() {
        let p = pipeline();
        assert!(p
            .observable::<u64>(inst("x", InstrumentKind::Counter))
            .is_err());
    }

    #[rstest]
    #[case(Some("delta"), Temporality::Delta)]
    #[case(Some("LowMemory"), Temporality::LowMemory)]
    #[case(Some("cumulative"), Temporality::Cumulative)]
    #[case(Some("bogus"), Temporality::Cumulative)]
    #[case(None, Temporality::Cumulative)]
    fn temporality_from_environment(#[case] value: Option<&str>, #[case] expected: Temporality) {
        temp_env::with_var(
            OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE,
            value,
            || {
                assert_eq!(PipelineBuilder::default().temporality, expected);
            },
        );
    }

    #[test]
    fn explicit_temporality_overrides_environment() {
        temp_env::with_var(
            OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE,
            Some("delta"),
            || {
                let builder = PipelineBuilder::default().with_temporality(Temporality::Cumulative);
                assert_eq!(builder.temporality, Temporality::Cumulative);
            },
        );
    }
}
