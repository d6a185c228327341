use std::time::{Duration, Instant};

use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_aggregate::{
    data::{AggregatedMetrics, Histogram, MetricData, ScopeMetrics, Sum},
    Context, Instrument, InstrumentKind, MetricError, Pipeline, PipelineBuilder, Temporality,
};
use rstest::rstest;
use tokio_util::sync::CancellationToken;

fn scope() -> InstrumentationScope {
    InstrumentationScope::builder("integration").build()
}

fn instrument(name: &'static str, kind: InstrumentKind) -> Instrument {
    Instrument::new()
        .with_name(name)
        .with_kind(kind)
        .with_unit("1")
        .with_scope(scope())
}

fn pipeline(temporality: Temporality) -> Pipeline {
    PipelineBuilder::default()
        .with_temporality(temporality)
        .build()
}

fn u64_histogram(collected: Vec<ScopeMetrics>) -> Option<Histogram<u64>> {
    collected
        .into_iter()
        .flat_map(|sm| sm.metrics)
        .find_map(|m| match m.data {
            AggregatedMetrics::U64(MetricData::Histogram(h)) => Some(h),
            _ => None,
        })
}

fn i64_sum(collected: Vec<ScopeMetrics>) -> Option<Sum<i64>> {
    collected
        .into_iter()
        .flat_map(|sm| sm.metrics)
        .find_map(|m| match m.data {
            AggregatedMetrics::I64(MetricData::Sum(s)) => Some(s),
            _ => None,
        })
}

#[test]
fn histogram_end_to_end() {
    let p = pipeline(Temporality::Cumulative);
    let h = p
        .instrument::<u64>(instrument("queue.depth", InstrumentKind::Histogram))
        .unwrap();
    let cx = Context::new();
    for v in [3, 1, 4, 1, 5] {
        h.measure(&cx, v, &[KeyValue::new("queue", "jobs")]);
    }

    let collected = p.collect().unwrap();
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].scope, scope());
    let metric = &collected[0].metrics[0];
    assert_eq!(metric.name, "queue.depth");
    assert_eq!(metric.unit, "1");
    assert_eq!(metric.kind, InstrumentKind::Histogram);

    let hist = u64_histogram(collected).unwrap();
    assert_eq!(hist.temporality, Temporality::Cumulative);
    assert!(hist.time >= hist.start_time);
    let dp = &hist.data_points[0];
    assert_eq!(dp.attributes, vec![KeyValue::new("queue", "jobs")]);
    assert_eq!(dp.count, 5);
    assert_eq!(dp.sum, 14);
    assert_eq!(dp.min, Some(1));
    assert_eq!(dp.max, Some(5));
    assert_eq!(dp.count, dp.bucket_counts.iter().sum::<u64>());
}

#[test]
fn delta_histogram_forgets_unseen_attribute_sets() {
    let p = pipeline(Temporality::Delta);
    let h = p
        .instrument::<u64>(instrument("latency", InstrumentKind::Histogram))
        .unwrap();
    let cx = Context::new();
    h.measure(&cx, 10, &[KeyValue::new("route", "/a")]);
    h.measure(&cx, 20, &[KeyValue::new("route", "/b")]);

    let first = u64_histogram(p.collect().unwrap()).unwrap();
    assert_eq!(first.temporality, Temporality::Delta);
    assert_eq!(first.data_points.len(), 2);

    // Nothing recorded since the last collection.
    assert!(p.collect().unwrap().is_empty());

    h.measure(&cx, 30, &[KeyValue::new("route", "/a")]);
    let third = u64_histogram(p.collect().unwrap()).unwrap();
    assert_eq!(third.data_points.len(), 1);
    assert_eq!(third.data_points[0].attributes, vec![KeyValue::new("route", "/a")]);
    assert!(third.start_time >= first.time);
}

#[test]
fn cumulative_histogram_keeps_history() {
    let p = pipeline(Temporality::Cumulative);
    let h = p
        .instrument::<u64>(instrument("latency", InstrumentKind::Histogram))
        .unwrap();
    let cx = Context::new();
    h.measure(&cx, 10, &[]);
    let first = u64_histogram(p.collect().unwrap()).unwrap();
    h.measure(&cx, 20, &[]);
    let second = u64_histogram(p.collect().unwrap()).unwrap();

    assert_eq!(first.data_points[0].count, 1);
    assert_eq!(second.data_points[0].count, 2);
    assert_eq!(second.data_points[0].sum, 30);
    assert_eq!(first.start_time, second.start_time);
}

#[rstest]
#[case(Temporality::Delta)]
#[case(Temporality::Cumulative)]
fn concurrent_writers_are_all_counted(#[case] temporality: Temporality) {
    const THREADS: u64 = 8;
    const VALUES: u64 = 1_000;

    let p = pipeline(temporality);
    let h = p
        .instrument::<u64>(instrument("work", InstrumentKind::Histogram))
        .unwrap();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let h = h.clone();
            s.spawn(move || {
                let cx = Context::new();
                for v in 0..VALUES {
                    h.measure(&cx, v, &[KeyValue::new("shard", (t % 3) as i64)]);
                }
            });
        }
    });

    let hist = u64_histogram(p.collect().unwrap()).unwrap();
    let total: u64 = hist.data_points.iter().map(|dp| dp.count).sum();
    assert_eq!(total, THREADS * VALUES);
    for dp in &hist.data_points {
        assert_eq!(dp.count, dp.bucket_counts.iter().sum::<u64>());
    }
}

#[test]
fn collection_racing_writers_loses_nothing() {
    const THREADS: i64 = 4;
    const VALUES: i64 = 5_000;

    let p = pipeline(Temporality::Delta);
    let counter = p
        .instrument::<i64>(instrument("ops", InstrumentKind::Counter))
        .unwrap();

    let mut collected_total = 0;
    std::thread::scope(|s| {
        let writers: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = counter.clone();
                s.spawn(move || {
                    let cx = Context::new();
                    for _ in 0..VALUES {
                        counter.measure(&cx, 1, &[]);
                    }
                })
            })
            .collect();

        while !writers.iter().all(|w| w.is_finished()) {
            if let Some(sum) = i64_sum(p.collect().unwrap()) {
                collected_total += sum.data_points.iter().map(|dp| dp.value).sum::<i64>();
            }
        }
    });
    if let Some(sum) = i64_sum(p.collect().unwrap()) {
        collected_total += sum.data_points.iter().map(|dp| dp.value).sum::<i64>();
    }

    assert_eq!(collected_total, THREADS * VALUES);
}

#[test]
fn cancelled_context_drops_measurements() {
    let p = pipeline(Temporality::Cumulative);
    let counter = p
        .instrument::<i64>(instrument("requests", InstrumentKind::UpDownCounter))
        .unwrap();

    let token = CancellationToken::new();
    let cx = Context::new().with_cancellation(token.clone());
    counter.measure(&cx, 5, &[]);
    token.cancel();
    counter.measure(&cx, 100, &[]);

    let expired = Context::new().with_deadline(Instant::now());
    counter.measure(&expired, 1_000, &[]);

    let live = Context::new().with_timeout(Duration::from_secs(60));
    counter.measure(&live, -2, &[]);

    let sum = i64_sum(p.collect().unwrap()).unwrap();
    assert!(!sum.is_monotonic);
    assert_eq!(sum.data_points[0].value, 3);
}

#[test]
fn observable_registration_guards() {
    let p = pipeline(Temporality::Cumulative);
    let observable = p
        .observable::<i64>(instrument("queue.size", InstrumentKind::ObservableUpDownCounter))
        .unwrap();

    let other = InstrumentationScope::builder("someone-else").build();
    let err = p
        .register_callback(&other, &[&observable], || {})
        .unwrap_err();
    assert_eq!(
        err,
        MetricError::InvalidRegistration {
            name: "queue.size".into(),
            created: "integration".into(),
            registered: "someone-else".into(),
        }
    );

    let observer = observable.clone();
    p.register_callback(&scope(), &[&observable], move || {
        observer.observe(7, &[]);
    })
    .unwrap();

    let sum = i64_sum(p.collect().unwrap()).unwrap();
    assert_eq!(sum.data_points[0].value, 7);
}

#[test]
fn snapshots_are_independent_copies() {
    let p = pipeline(Temporality::Cumulative);
    let h = p
        .instrument::<u64>(instrument("size", InstrumentKind::Histogram))
        .unwrap();
    h.measure(&Context::new(), 1, &[KeyValue::new("k", "v")]);

    let mut first = u64_histogram(p.collect().unwrap()).unwrap();
    first.data_points[0].bucket_counts.iter_mut().for_each(|c| *c = 99);
    first.data_points[0].bounds.clear();

    let second = u64_histogram(p.collect().unwrap()).unwrap();
    assert_eq!(second.data_points[0].count, 1);
    assert_eq!(second.data_points[0].bucket_counts.iter().sum::<u64>(), 1);
    assert!(!second.data_points[0].bounds.is_empty());
}

#[test]
fn observable_counter_reset_reports_new_total() {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    let p = pipeline(Temporality::Delta);
    let observable = p
        .observable::<u64>(instrument("bytes.sent", InstrumentKind::ObservableCounter))
        .unwrap();

    let total = Arc::new(AtomicU64::new(100));
    let (observer, reading) = (observable.clone(), Arc::clone(&total));
    p.register_callback(&scope(), &[&observable], move || {
        observer.observe(reading.load(Ordering::Relaxed), &[]);
    })
    .unwrap();

    let u64_sum = |collected: Vec<ScopeMetrics>| {
        collected
            .into_iter()
            .flat_map(|sm| sm.metrics)
            .find_map(|m| match m.data {
                AggregatedMetrics::U64(MetricData::Sum(s)) => Some(s),
                _ => None,
            })
    };

    let first = u64_sum(p.collect().unwrap()).unwrap();
    assert_eq!(first.data_points[0].value, 100);

    // The observed source restarted.
    total.store(3, Ordering::Relaxed);
    let second = u64_sum(p.collect().unwrap()).unwrap();
    assert!(second.is_monotonic);
    assert_eq!(second.data_points[0].value, 3);
}
