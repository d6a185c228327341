//! # OpenTelemetry Aggregate
//!
//! The in-process aggregation core of an OpenTelemetry metrics SDK. Instruments
//! record measurements concurrently into per-attribute-set aggregators (sums,
//! last values and explicit bucket histograms), and a [Pipeline] periodically
//! collects owned snapshots of them with delta or cumulative temporality.
//!
//! ## Getting Started
//!
//! ```
//! use opentelemetry::{InstrumentationScope, KeyValue};
//! use opentelemetry_aggregate::{
//!     data::{AggregatedMetrics, MetricData},
//!     Context, Instrument, InstrumentKind, PipelineBuilder, Temporality,
//! };
//!
//! let pipeline = PipelineBuilder::default()
//!     .with_temporality(Temporality::Delta)
//!     .build();
//!
//! let latency = pipeline
//!     .instrument::<f64>(
//!         Instrument::new()
//!             .with_name("http.server.duration")
//!             .with_kind(InstrumentKind::Histogram)
//!             .with_unit("ms")
//!             .with_scope(InstrumentationScope::builder("my-service").build()),
//!     )
//!     .unwrap();
//!
//! latency.measure(&Context::new(), 12.5, &[KeyValue::new("http.method", "GET")]);
//!
//! for scope_metrics in pipeline.collect().unwrap() {
//!     for metric in scope_metrics.metrics {
//!         if let AggregatedMetrics::F64(MetricData::Histogram(histogram)) = metric.data {
//!             assert_eq!(histogram.data_points[0].count, 1);
//!         }
//!     }
//! }
//! ```
//!
//! ## Crate Feature Flags
//!
//! * `internal-logs`: enabled by default, emits internal diagnostics through
//!   `tracing`.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(clippy::needless_doctest_main)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

pub(crate) mod aggregation;
pub(crate) mod attribute_set;
pub(crate) mod context;
pub mod data;
pub(crate) mod error;
pub(crate) mod instrument;
pub(crate) mod internal;
pub(crate) mod pipeline;
pub(crate) mod view;

pub use aggregation::{Aggregation, DEFAULT_HISTOGRAM_BOUNDARIES};
pub use attribute_set::AttributeSet;
pub use context::Context;
pub use data::Temporality;
pub use error::{MetricError, MetricResult};
pub use instrument::{
    Instrument, InstrumentKind, Observable, Registerable, ResolvedMeasures, Stream, StreamBuilder,
};
#[doc(hidden)]
pub use internal::IntoAggregatedMetrics;
pub use internal::Number;
pub use pipeline::{Pipeline, PipelineBuilder, OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE};
pub use view::{new_view, View};
