use std::{borrow::Cow, collections::HashSet, fmt, sync::Arc};

use opentelemetry::{otel_debug, InstrumentationScope, Key, KeyValue};

use crate::{
    aggregation::Aggregation,
    context::Context,
    data::Temporality,
    error::{MetricError, MetricResult},
    internal::{Filter, Measure},
};

/// The identifier of a group of instruments that all perform the same function.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum InstrumentKind {
    /// Identifies a group of instruments that record increasing values synchronously
    /// with the code path they are measuring.
    Counter,
    /// A group of instruments that record increasing and decreasing values
    /// synchronously with the code path they are measuring.
    UpDownCounter,
    /// A group of instruments that record a distribution of values synchronously with
    /// the code path they are measuring.
    Histogram,
    /// A group of instruments that record current value synchronously with
    /// the code path they are measuring.
    Gauge,
    /// A group of instruments that record increasing values in an asynchronous
    /// callback.
    ObservableCounter,
    /// A group of instruments that record increasing and decreasing values in an
    /// asynchronous callback.
    ObservableUpDownCounter,
    /// A group of instruments that record current values in an asynchronous callback.
    ObservableGauge,
}

impl InstrumentKind {
    /// Select the [Temporality] an instrument of this kind is aggregated with,
    /// given the configured preference.
    ///
    /// Up-down counters stay cumulative under a delta preference. A low memory
    /// preference only makes synchronous counters and histograms delta.
    pub fn temporality_preference(&self, temporality: Temporality) -> Temporality {
        match temporality {
            Temporality::Delta => match self {
                Self::Counter
                | Self::Histogram
                | Self::ObservableCounter
                | Self::Gauge
                | Self::ObservableGauge => Temporality::Delta,
                Self::UpDownCounter | Self::ObservableUpDownCounter => Temporality::Cumulative,
            },
            Temporality::LowMemory => match self {
                Self::Counter | Self::Histogram => Temporality::Delta,
                Self::ObservableCounter
                | Self::Gauge
                | Self::ObservableGauge
                | Self::UpDownCounter
                | Self::ObservableUpDownCounter => Temporality::Cumulative,
            },
            _ => Temporality::Cumulative,
        }
    }

    /// Whether instruments of this kind only ever increase.
    pub(crate) fn is_monotonic(&self) -> bool {
        matches!(self, Self::Counter | Self::ObservableCounter | Self::Histogram)
    }
}

/// Describes the properties of an instrument at creation.
///
/// The same type is used as view criteria: every field left empty (or a kind
/// left unset) matches any value of that field.
///
/// # Example
///
/// ```
/// use opentelemetry_aggregate::{Instrument, InstrumentKind};
///
/// let criteria = Instrument::new().with_kind(InstrumentKind::Histogram);
/// let inst = Instrument::new()
///     .with_name("request.latency")
///     .with_kind(InstrumentKind::Histogram)
///     .with_unit("ms");
///
/// assert!(criteria.matches(&inst));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Instrument {
    /// The human-readable identifier of the instrument.
    pub(crate) name: Cow<'static, str>,
    /// describes the purpose of the instrument.
    pub(crate) description: Cow<'static, str>,
    /// The functional group of the instrument.
    pub(crate) kind: Option<InstrumentKind>,
    /// Unit is the unit of measurement recorded by the instrument.
    pub(crate) unit: Cow<'static, str>,
    /// The instrumentation that created the instrument.
    pub(crate) scope: InstrumentationScope,
}

impl Instrument {
    /// Create a new instrument with every field empty.
    pub fn new() -> Self {
        Instrument::default()
    }

    /// Set the instrument name.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the instrument description.
    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the instrument kind.
    pub fn with_kind(mut self, kind: InstrumentKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set the instrument unit.
    pub fn with_unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Set the instrument scope.
    pub fn with_scope(mut self, scope: InstrumentationScope) -> Self {
        self.scope = scope;
        self
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    /// Instrument description.
    pub fn description(&self) -> &str {
        self.description.as_ref()
    }

    /// Instrument kind.
    pub fn kind(&self) -> Option<InstrumentKind> {
        self.kind
    }

    /// Instrument unit.
    pub fn unit(&self) -> &str {
        self.unit.as_ref()
    }

    /// Instrument scope.
    pub fn scope(&self) -> &InstrumentationScope {
        &self.scope
    }

    /// Returns `true` if every field is unset.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.description.is_empty()
            && self.kind.is_none()
            && self.unit.is_empty()
            && self.scope == InstrumentationScope::default()
    }

    /// Whether every set field of `self` equals the same field of `other`.
    ///
    /// An empty instrument matches everything.
    pub fn matches(&self, other: &Instrument) -> bool {
        self.matches_name(other)
            && self.matches_description(other)
            && self.matches_kind(other)
            && self.matches_unit(other)
            && self.matches_scope(other)
    }

    /// Name is empty or equal to the name of `other`.
    pub fn matches_name(&self, other: &Instrument) -> bool {
        self.name.is_empty() || self.name == other.name
    }

    /// Description is empty or equal to the description of `other`.
    pub fn matches_description(&self, other: &Instrument) -> bool {
        self.description.is_empty() || self.description == other.description
    }

    /// Kind is unset or equal to the kind of `other`.
    pub fn matches_kind(&self, other: &Instrument) -> bool {
        self.kind.is_none() || self.kind == other.kind
    }

    /// Unit is empty or equal to the unit of `other`.
    pub fn matches_unit(&self, other: &Instrument) -> bool {
        self.unit.is_empty() || self.unit == other.unit
    }

    /// Each of the scope name, version and schema URL is empty or equal to
    /// the same field of the scope of `other`.
    pub fn matches_scope(&self, other: &Instrument) -> bool {
        let (this, that) = (&self.scope, &other.scope);
        (this.name().is_empty() || this.name() == that.name())
            && (this.version().is_none() || this.version() == that.version())
            && (this.schema_url().is_none() || this.schema_url() == that.schema_url())
    }
}

/// A builder for creating Stream objects.
///
/// # Example
///
/// ```
/// use opentelemetry_aggregate::{Aggregation, Stream};
/// use opentelemetry::Key;
///
/// let stream = Stream::builder()
///     .with_name("my_stream")
///     .with_aggregation(Aggregation::Sum)
///     .with_allowed_attribute_keys([Key::new("http.method")])
///     .build()
///     .unwrap();
/// ```
#[derive(Default, Debug)]
pub struct StreamBuilder {
    name: Option<Cow<'static, str>>,
    description: Option<Cow<'static, str>>,
    unit: Option<Cow<'static, str>>,
    aggregation: Option<Aggregation>,
    allowed_attribute_keys: Option<Arc<HashSet<Key>>>,
}

impl StreamBuilder {
    /// Set the stream name. If this is not set, the instrument name is used.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the stream description. If this is not set, the instrument
    /// description is used.
    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the stream unit. If this is not set, the instrument unit is used.
    pub fn with_unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the stream aggregation.
    /// If not set, the default aggregation based on the instrument kind will be used.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    /// Set the stream allowed attribute keys.
    ///
    /// Any attribute recorded for the stream with a key not in this set will be
    /// dropped. If the set is empty, all attributes will be dropped.
    /// If this method is not used, all attributes will be kept.
    pub fn with_allowed_attribute_keys(
        mut self,
        attribute_keys: impl IntoIterator<Item = Key>,
    ) -> Self {
        self.allowed_attribute_keys = Some(Arc::new(attribute_keys.into_iter().collect()));
        self
    }

    /// Build a new Stream instance using the configuration in this builder.
    ///
    /// Fails if the aggregation is invalid.
    pub fn build(self) -> MetricResult<Stream> {
        if let Some(aggregation) = &self.aggregation {
            aggregation.validate()?;
        }

        Ok(Stream {
            name: self.name,
            description: self.description,
            unit: self.unit,
            aggregation: self.aggregation,
            allowed_attribute_keys: self.allowed_attribute_keys,
        })
    }
}

/// Describes the stream of data an instrument produces.
///
/// Unset fields fall back to the properties of the instrument.
#[derive(Clone, Default, Debug)]
pub struct Stream {
    /// The human-readable identifier of the stream.
    pub(crate) name: Option<Cow<'static, str>>,
    /// Describes the purpose of the data.
    pub(crate) description: Option<Cow<'static, str>>,
    /// the unit of measurement recorded.
    pub(crate) unit: Option<Cow<'static, str>>,
    /// Aggregation the stream uses for an instrument.
    pub(crate) aggregation: Option<Aggregation>,
    /// An allow-list of attribute keys that will be preserved for the stream.
    ///
    /// Any attribute recorded for the stream with a key not in this set will be
    /// dropped. If the set is empty, all attributes will be dropped, if `None` all
    /// attributes will be kept.
    pub(crate) allowed_attribute_keys: Option<Arc<HashSet<Key>>>,
}

impl Stream {
    /// Create a new stream builder with default values.
    pub fn builder() -> StreamBuilder {
        StreamBuilder::default()
    }

    /// The filter that keeps only the allowed attribute keys, or `None` when
    /// every attribute is kept.
    pub(crate) fn attribute_filter(&self) -> Option<Filter> {
        self.allowed_attribute_keys.as_ref().map(|allowed| {
            let allowed = Arc::clone(allowed);
            Arc::new(move |kv: &KeyValue| allowed.contains(&kv.key)) as Filter
        })
    }
}

/// The identifying properties of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StreamId {
    /// The human-readable identifier of the stream.
    pub(crate) name: Cow<'static, str>,
    /// Describes the purpose of the data.
    pub(crate) description: Cow<'static, str>,
    /// The unit of measurement recorded.
    pub(crate) unit: Cow<'static, str>,
    /// The stream aggregation name.
    pub(crate) aggregation: String,
    /// Monotonicity of the data, only meaningful for sums.
    pub(crate) monotonic: bool,
    /// The temporality the stream is collected with, unset for aggregations
    /// that have none.
    pub(crate) temporality: Option<Temporality>,
    /// Number is the underlying data type of the instrument.
    pub(crate) number: Cow<'static, str>,
}

impl StreamId {
    /// Instrument names are considered case-insensitive ASCII.
    ///
    /// Standardize the name to always be lowercase so it can be compared
    /// via hash.
    pub(crate) fn normalize(&mut self) {
        if self.name.chars().any(|c| c.is_ascii_uppercase()) {
            self.name = self.name.to_ascii_lowercase().into();
        }
    }
}

/// The aggregators a synchronous instrument records into.
///
/// Cheap to clone; clones record into the same aggregators.
#[derive(Clone)]
pub struct ResolvedMeasures<T> {
    pub(crate) measures: Vec<Arc<dyn Measure<T>>>,
}

impl<T> fmt::Debug for ResolvedMeasures<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedMeasures")
            .field("measures", &self.measures.len())
            .finish()
    }
}

impl<T: Copy + 'static> ResolvedMeasures<T> {
    /// Record `value` with `attrs` in every aggregator, in the order they were
    /// resolved.
    ///
    /// The measurement is dropped if `cx` is cancelled or past its deadline.
    pub fn measure(&self, cx: &Context, value: T, attrs: &[KeyValue]) {
        if cx.is_done() {
            otel_debug!(
                name: "ResolvedMeasures.MeasurementDropped",
                message = "Context is done; measurement dropped."
            );
            return;
        }
        for measure in &self.measures {
            measure.call(value, attrs)
        }
    }

    /// Returns `true` if no aggregator records this instrument, e.g. because
    /// every matching view drops it.
    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }
}

/// Checks whether an asynchronous instrument may take part in a callback
/// registered with a given instrumentation scope.
pub trait Registerable {
    /// Returns an error if this instrument should not be registered with
    /// `scope`.
    fn registerable(&self, scope: &InstrumentationScope) -> MetricResult<()>;
}

/// An asynchronous instrument, observed from registered callbacks.
#[derive(Clone)]
pub struct Observable<T> {
    pub(crate) name: Cow<'static, str>,
    pub(crate) description: Cow<'static, str>,
    pub(crate) kind: InstrumentKind,
    pub(crate) unit: Cow<'static, str>,
    pub(crate) scope: InstrumentationScope,
    pub(crate) measures: Vec<Arc<dyn Measure<T>>>,
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("kind", &self.kind)
            .field("unit", &self.unit)
            .field("scope", &self.scope)
            .field("measures", &self.measures.len())
            .finish()
    }
}

impl<T: Copy + 'static> Observable<T> {
    pub(crate) fn new(
        inst: &Instrument,
        kind: InstrumentKind,
        measures: Vec<Arc<dyn Measure<T>>>,
    ) -> Self {
        Observable {
            name: inst.name.clone(),
            description: inst.description.clone(),
            kind,
            unit: inst.unit.clone(),
            scope: inst.scope.clone(),
            measures,
        }
    }

    /// Record `value` with `attrs` in every aggregator of this observable.
    pub fn observe(&self, value: T, attrs: &[KeyValue]) {
        for measure in &self.measures {
            measure.call(value, attrs)
        }
    }

    /// The instrument name.
    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    /// The instrument description.
    pub fn description(&self) -> &str {
        self.description.as_ref()
    }

    /// The instrument kind.
    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    /// The instrument unit.
    pub fn unit(&self) -> &str {
        self.unit.as_ref()
    }
}

impl<T> Registerable for Observable<T> {
    fn registerable(&self, scope: &InstrumentationScope) -> MetricResult<()> {
        if self.measures.is_empty() {
            return Err(MetricError::NoAggregators);
        }
        if *scope != self.scope {
            return Err(MetricError::InvalidRegistration {
                name: self.name.to_string(),
                created: self.scope.name().to_string(),
                registered: scope.name().to_string(),
            });
        }
        Ok(())
    }
}
