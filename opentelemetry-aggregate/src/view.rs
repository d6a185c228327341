use regex::Regex;

use crate::error::{MetricError, MetricResult};

use super::instrument::{Instrument, Stream};

/// Used to customize the metrics that are output by a [Pipeline].
///
/// Here are some examples when a [View] might be needed:
///
/// * Customize which Instruments are to be processed/ignored. For example, an
///   instrumented library can provide both temperature and humidity, but the
///   application developer might only want temperature.
/// * Customize the aggregation - if the default aggregation associated with the
///   [Instrument] does not meet the needs of the user. For example, an HTTP client
///   library might expose HTTP client request duration as Histogram by default,
///   but the application developer might only want the total count of outgoing
///   requests.
/// * Customize which attribute(s) are to be reported on metrics. For example,
///   an HTTP server library might expose HTTP verb (e.g. GET, POST) and HTTP
///   status code (e.g. 200, 301, 404). The application developer might only care
///   about HTTP status code.
///
/// # Example Custom View
///
/// View is implemented for all `Fn(&Instrument) -> Option<Stream>`.
///
/// ```
/// use opentelemetry_aggregate::{Instrument, PipelineBuilder, Stream};
///
/// // return streams for the given instrument
/// let my_view = |i: &Instrument| {
///   // return Some(Stream) or
///   None
/// };
///
/// let pipeline = PipelineBuilder::default().with_view(my_view).build();
/// # drop(pipeline)
/// ```
///
/// [Pipeline]: crate::Pipeline
pub trait View: Send + Sync + 'static {
    /// Defines how data should be collected for certain instruments.
    ///
    /// Return [Stream] to use for matching [Instrument]s,
    /// otherwise if there is no match, return `None`.
    fn match_inst(&self, inst: &Instrument) -> Option<Stream>;
}

impl<T> View for T
where
    T: Fn(&Instrument) -> Option<Stream> + Send + Sync + 'static,
{
    fn match_inst(&self, inst: &Instrument) -> Option<Stream> {
        self(inst)
    }
}

/// Creates a [View] that applies the [Stream] mask for all instruments that
/// match criteria.
///
/// The returned [View] will only apply the mask if all non-empty fields of
/// criteria match the corresponding [Instrument] passed to the view. If all
/// fields of the criteria are their default values an error is returned. If
/// you need to match an empty-value field, create a [View] directly.
///
/// An error is also returned if the mask renames instruments matched by a
/// wildcard, or if its aggregation is invalid.
///
/// The [Instrument::name] field of criteria supports wildcard pattern
/// matching. The wildcard `*` is recognized as matching zero or more
/// characters, and `?` is recognized as matching exactly one character. For
/// example, a pattern of `*` will match all instrument names.
///
/// The [Stream] mask only applies updates for non-empty fields. By default,
/// the [Instrument] the [View] matches against will be used for the name,
/// description, and unit of the returned [Stream] and no `aggregation` or
/// `allowed_attribute_keys` are set. All non-empty fields of mask are used
/// instead of the default. If you need to set an empty value in the returned
/// stream, create a custom [View] directly.
///
/// # Example
///
/// ```
/// use opentelemetry_aggregate::{new_view, Aggregation, Instrument, Stream};
///
/// let criteria = Instrument::new().with_name("counter_*");
/// let mask = Stream::builder()
///     .with_aggregation(Aggregation::Sum)
///     .build()
///     .unwrap();
///
/// let view = new_view(criteria, mask);
/// # drop(view);
/// ```
pub fn new_view(criteria: Instrument, mask: Stream) -> MetricResult<impl View> {
    if criteria.is_empty() {
        return Err(MetricError::Config(format!(
            "no criteria provided, dropping view. mask: {mask:?}"
        )));
    }
    let contains_wildcard = criteria.name.contains(['*', '?']);

    let match_fn: Box<dyn Fn(&Instrument) -> bool + Send + Sync> = if contains_wildcard {
        if mask.name.is_some() {
            return Err(MetricError::Config(format!(
                "name replacement for multiple instruments, dropping view, criteria: {criteria:?}, mask: {mask:?}"
            )));
        }

        let pattern = format!(
            "^{}$",
            regex::escape(&criteria.name)
                .replace(r"\*", ".*")
                .replace(r"\?", ".")
        );
        let name_re = Regex::new(&pattern).map_err(|e| MetricError::Config(e.to_string()))?;
        Box::new(move |i: &Instrument| {
            name_re.is_match(&i.name)
                && criteria.matches_description(i)
                && criteria.matches_kind(i)
                && criteria.matches_unit(i)
                && criteria.matches_scope(i)
        })
    } else {
        Box::new(move |i: &Instrument| criteria.matches(i))
    };

    if let Some(aggregation) = &mask.aggregation {
        aggregation.validate()?;
    }

    Ok(move |i: &Instrument| -> Option<Stream> {
        if match_fn(i) {
            Some(mask.clone())
        } else {
            None
        }
    })
}
