//! Per-namespace request metrics.

use std::sync::Arc;

use metrics::{Counter, Label};

use crate::error::Result;
use crate::metrics::{family_name, MetricDoc, MetricType, MetricsRegistry, HISTOGRAM_SUFFIX};
use crate::relabel::{LabelSchema, LabelVector};
use crate::template::Record;

/// Log field feeding the response size counter. The counter is integral:
/// values are rounded to whole bytes and negative values are skipped.
pub const BYTES_FIELD: &str = "body_bytes_sent";
/// Log field feeding the upstream time distributions.
pub const UPSTREAM_TIME_FIELD: &str = "upstream_response_time";
/// Log field feeding the response time distributions.
pub const RESPONSE_TIME_FIELD: &str = "request_time";

const COUNT_TOTAL: &str = "http_response_count_total";
const BYTES_TOTAL: &str = "http_response_size_bytes";
const UPSTREAM_SECONDS: &str = "http_upstream_time_seconds";
const RESPONSE_SECONDS: &str = "http_response_time_seconds";
const PARSE_ERRORS_TOTAL: &str = "parse_errors_total";

/// Names of the histogram families of a namespace.
pub fn histogram_families(namespace: &str) -> [String; 2] {
    [
        family_name(namespace, &format!("{UPSTREAM_SECONDS}{HISTOGRAM_SUFFIX}")),
        family_name(namespace, &format!("{RESPONSE_SECONDS}{HISTOGRAM_SUFFIX}")),
    ]
}

#[derive(Debug, Clone)]
struct FamilyNames {
    count_total: String,
    bytes_total: String,
    upstream_seconds: String,
    upstream_seconds_hist: String,
    response_seconds: String,
    response_seconds_hist: String,
    parse_errors_total: String,
}

impl FamilyNames {
    fn new(namespace: &str) -> Self {
        let [upstream_seconds_hist, response_seconds_hist] = histogram_families(namespace);
        Self {
            count_total: family_name(namespace, COUNT_TOTAL),
            bytes_total: family_name(namespace, BYTES_TOTAL),
            upstream_seconds: family_name(namespace, UPSTREAM_SECONDS),
            upstream_seconds_hist,
            response_seconds: family_name(namespace, RESPONSE_SECONDS),
            response_seconds_hist,
            parse_errors_total: family_name(namespace, PARSE_ERRORS_TOTAL),
        }
    }
}

/// Counters and distributions of one namespace, all labeled with the
/// namespace's [`LabelSchema`] except the parse error counter.
///
/// Safe to share between ingestion tasks; every update goes through atomic
/// handles obtained from the registry.
pub struct NamespaceMetrics {
    registry: Arc<MetricsRegistry>,
    schema: Arc<LabelSchema>,
    names: FamilyNames,
    parse_errors: Counter,
}

impl NamespaceMetrics {
    /// Registers the namespace's families with `registry`. The label schema
    /// is fixed here for every labeled family.
    pub fn register(
        registry: Arc<MetricsRegistry>,
        namespace: &str,
        schema: Arc<LabelSchema>,
    ) -> Result<Self> {
        let names = FamilyNames::new(namespace);
        registry.register(Self::documentation(&names, &schema))?;

        // Registered eagerly so a namespace that only ever sees garbage still
        // exposes a zero.
        let parse_errors = registry.counter(&names.parse_errors_total, Vec::new());

        Ok(Self {
            registry,
            schema,
            names,
            parse_errors,
        })
    }

    fn documentation(names: &FamilyNames, schema: &LabelSchema) -> Vec<MetricDoc> {
        let labels = schema.names().to_vec();
        let labeled = |name: &String, metric_type, help| MetricDoc {
            name: name.clone(),
            metric_type,
            help,
            labels: labels.clone(),
        };

        vec![
            labeled(
                &names.count_total,
                MetricType::Counter,
                "Amount of processed HTTP requests",
            ),
            labeled(
                &names.bytes_total,
                MetricType::Counter,
                "Total amount of transferred bytes",
            ),
            labeled(
                &names.upstream_seconds,
                MetricType::Summary,
                "Time needed by upstream servers to handle requests",
            ),
            labeled(
                &names.upstream_seconds_hist,
                MetricType::Histogram,
                "Time needed by upstream servers to handle requests",
            ),
            labeled(
                &names.response_seconds,
                MetricType::Summary,
                "Time needed to handle requests",
            ),
            labeled(
                &names.response_seconds_hist,
                MetricType::Histogram,
                "Time needed to handle requests",
            ),
            MetricDoc {
                name: names.parse_errors_total.clone(),
                metric_type: MetricType::Counter,
                help: "Total number of log file lines that could not be parsed",
                labels: Vec::new(),
            },
        ]
    }

    pub fn schema(&self) -> &Arc<LabelSchema> {
        &self.schema
    }

    /// Records one successfully parsed line.
    ///
    /// The request counter always increments. Each numeric observation is
    /// skipped on its own when its field is absent or not a number.
    pub fn observe(&self, labels: &LabelVector, record: &Record) {
        debug_assert_eq!(labels.len(), self.schema.len());

        let key_labels: Vec<Label> = self
            .schema
            .names()
            .iter()
            .zip(labels.values())
            .map(|(name, value)| Label::new(name.clone(), value.clone()))
            .collect();

        self.registry
            .counter(&self.names.count_total, key_labels.clone())
            .increment(1);

        if let Some(bytes) = record.float_field(BYTES_FIELD).filter(|b| *b >= 0.0) {
            self.registry
                .counter(&self.names.bytes_total, key_labels.clone())
                .increment(bytes.round() as u64);
        }

        if let Some(seconds) = record.float_field(UPSTREAM_TIME_FIELD) {
            self.observe_distribution(
                &self.names.upstream_seconds,
                &self.names.upstream_seconds_hist,
                &key_labels,
                seconds,
            );
        }

        if let Some(seconds) = record.float_field(RESPONSE_TIME_FIELD) {
            self.observe_distribution(
                &self.names.response_seconds,
                &self.names.response_seconds_hist,
                &key_labels,
                seconds,
            );
        }
    }

    fn observe_distribution(&self, summary: &str, histogram: &str, labels: &[Label], value: f64) {
        self.registry
            .histogram(summary, labels.to_vec())
            .record(value);
        self.registry
            .histogram(histogram, labels.to_vec())
            .record(value);
    }

    /// Records a line that could not be parsed.
    pub fn parse_error(&self) {
        self.parse_errors.increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relabel::RelabelPipeline;

    fn setup(namespace: &str) -> (Arc<MetricsRegistry>, RelabelPipeline, NamespaceMetrics) {
        let registry = Arc::new(MetricsRegistry::new(&[]).unwrap());
        let pipeline = RelabelPipeline::compile(namespace, &[], &[], &[]).unwrap();
        let metrics =
            NamespaceMetrics::register(registry.clone(), namespace, pipeline.schema().clone())
                .unwrap();
        (registry, pipeline, metrics)
    }

    #[test]
    fn test_registers_all_families() {
        let (registry, _, _) = setup("nginx");
        for name in [
            "nginx_http_response_count_total",
            "nginx_http_response_size_bytes",
            "nginx_http_upstream_time_seconds",
            "nginx_http_upstream_time_seconds_hist",
            "nginx_http_response_time_seconds",
            "nginx_http_response_time_seconds_hist",
            "nginx_parse_errors_total",
        ] {
            assert!(registry.is_registered(name), "{name} not registered");
        }
        assert!(registry.render().contains("nginx_parse_errors_total 0"));
    }

    #[test]
    fn test_same_namespace_twice_is_rejected() {
        let (registry, pipeline, _) = setup("nginx");
        let second = NamespaceMetrics::register(registry, "nginx", pipeline.schema().clone());
        assert!(second.is_err());
    }

    #[test]
    fn test_observe_skips_only_missing_numbers() {
        let (registry, pipeline, metrics) = setup("web");
        let record: Record = [
            ("status", "200"),
            ("body_bytes_sent", "-"),
            ("request_time", "0.5"),
        ]
        .into_iter()
        .collect();

        let labels = pipeline.apply(&record);
        assert_eq!(labels.len(), metrics.schema().len());
        metrics.observe(&labels, &record);

        let text = registry.render();
        assert!(text.contains("web_http_response_count_total{method=\"\",status=\"200\"} 1"));
        assert!(!text.contains("web_http_response_size_bytes{"));
        assert!(!text.contains("web_http_upstream_time_seconds_count"));
        assert!(text.contains("web_http_response_time_seconds_count{method=\"\",status=\"200\"} 1"));
        assert!(text.contains("web_http_response_time_seconds_hist_count{method=\"\",status=\"200\"} 1"));
    }

    #[test]
    fn test_bytes_are_rounded_and_negatives_skipped() {
        let (registry, pipeline, metrics) = setup("web");
        for bytes in ["10.6", "-4", "2"] {
            let record: Record = [("status", "200"), ("body_bytes_sent", bytes)]
                .into_iter()
                .collect();
            metrics.observe(&pipeline.apply(&record), &record);
        }

        let text = registry.render();
        assert!(text.contains("web_http_response_size_bytes{method=\"\",status=\"200\"} 13"));
        assert!(text.contains("web_http_response_count_total{method=\"\",status=\"200\"} 3"));
    }

    #[test]
    fn test_parse_error_counter() {
        let (registry, _, metrics) = setup("web");
        metrics.parse_error();
        metrics.parse_error();
        assert!(registry.render().contains("web_parse_errors_total 2"));
    }
}
