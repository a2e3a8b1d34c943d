//! Prometheus text exposition of a metrics snapshot.
//!
//! A snapshot is registered as a `prometheus-client` collector and encoded in
//! the OpenMetrics text format. Serving the text over HTTP is left to the host
//! application.

use std::fmt;

use prometheus_client::collector::Collector;
use prometheus_client::encoding::{DescriptorEncoder, EncodeMetric};
use prometheus_client::metrics::MetricType;
use prometheus_client::metrics::counter::ConstCounter;
use prometheus_client::metrics::gauge::ConstGauge;
use prometheus_client::registry::Registry;

use crate::metrics::{HistogramSnapshot, MetricValue, MetricsSnapshot};

/// Quantiles emitted for every histogram.
pub const SUMMARY_QUANTILES: [f64; 4] = [0.5, 0.9, 0.95, 0.99];

/// Converts a dotted metric name into a Prometheus-compatible identifier,
/// optionally prefixed with `namespace_`.
#[must_use]
pub fn prometheus_name(name: &str, namespace: Option<&str>) -> String {
    let mut out = String::with_capacity(name.len() + namespace.map_or(0, |ns| ns.len() + 1));
    if let Some(namespace) = namespace.filter(|ns| !ns.is_empty()) {
        out.push_str(namespace);
        out.push('_');
    }
    out.extend(name.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }));
    out
}

/// Collector exposing a frozen [`MetricsSnapshot`].
///
/// Counters are emitted with the `_total` suffix. A histogram becomes a gauge
/// family labelled by `quantile`, plus `<name>_sum` and `<name>_count` over
/// its retained samples.
#[derive(Debug)]
pub struct SnapshotCollector {
    snapshot: MetricsSnapshot,
    namespace: Option<String>,
}

impl SnapshotCollector {
    /// Wraps `snapshot`, prefixing every name with `namespace_` when given.
    #[must_use]
    pub fn new(snapshot: MetricsSnapshot, namespace: Option<&str>) -> Self {
        Self {
            snapshot,
            namespace: namespace.map(str::to_owned),
        }
    }

    fn encode_histogram(
        encoder: &mut DescriptorEncoder,
        name: &str,
        source: &str,
        histogram: &HistogramSnapshot,
    ) -> Result<(), fmt::Error> {
        {
            let help = format!("Quantiles of `{source}` over retained samples");
            let mut family = encoder.encode_descriptor(name, &help, None, MetricType::Gauge)?;
            for quantile in SUMMARY_QUANTILES {
                let Some(value) = histogram.percentile(quantile) else {
                    continue;
                };
                let label = quantile.to_string();
                let labels = [("quantile", label.as_str())];
                ConstGauge::new(value).encode(family.encode_family(&labels)?)?;
            }
        }

        let sum_name = format!("{name}_sum");
        let help = format!("Sum of retained `{source}` samples");
        let sum = encoder.encode_descriptor(&sum_name, &help, None, MetricType::Gauge)?;
        ConstGauge::new(histogram.sum()).encode(sum)?;

        let count_name = format!("{name}_count");
        let help = format!("Number of retained `{source}` samples");
        let count = encoder.encode_descriptor(&count_name, &help, None, MetricType::Gauge)?;
        ConstGauge::new(i64::try_from(histogram.len()).unwrap_or(i64::MAX)).encode(count)
    }
}

impl Collector for SnapshotCollector {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), fmt::Error> {
        for (source, value) in self.snapshot.iter() {
            let name = prometheus_name(source, self.namespace.as_deref());
            match value {
                MetricValue::Counter(total) => {
                    let help = format!("Counter `{source}`");
                    let metric =
                        encoder.encode_descriptor(&name, &help, None, MetricType::Counter)?;
                    ConstCounter::new(*total).encode(metric)?;
                }
                MetricValue::Gauge(current) => {
                    let help = format!("Gauge `{source}`");
                    let metric = encoder.encode_descriptor(&name, &help, None, MetricType::Gauge)?;
                    ConstGauge::new(*current).encode(metric)?;
                }
                MetricValue::Histogram(histogram) => {
                    Self::encode_histogram(&mut encoder, &name, source, histogram)?;
                }
            }
        }
        Ok(())
    }
}

/// Renders every metric in the snapshot in the OpenMetrics text format.
///
/// # Errors
///
/// Propagates a formatting error raised by the encoder.
pub fn render_prometheus(
    snapshot: &MetricsSnapshot,
    namespace: Option<&str>,
) -> Result<String, fmt::Error> {
    let mut registry = Registry::default();
    registry.register_collector(Box::new(SnapshotCollector::new(snapshot.clone(), namespace)));

    let mut out = String::new();
    prometheus_client::encoding::text::encode(&mut out, &registry)?;
    Ok(out)
}
