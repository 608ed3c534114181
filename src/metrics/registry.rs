//! The process-wide metrics registry.
//!
//! Wraps a Prometheus recorder that is built but never installed as the
//! global recorder, so every namespace and the scrape endpoint reach the same
//! series through an explicit `Arc<MetricsRegistry>`. Registration of metric
//! families detects naming conflicts up front.

use std::collections::HashMap;
use std::sync::Mutex;

use metrics::{Counter, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, SharedString};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tracing::{debug, info};

use crate::config::NamespaceConfig;
use crate::error::{ExporterError, Result};
use crate::metrics::namespace::histogram_families;
use crate::metrics::{MetricDoc, MetricType, DEFAULT_BUCKETS};

pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    documented: Mutex<HashMap<String, MetricDoc>>,
}

impl MetricsRegistry {
    /// Builds a registry whose histogram families are those of
    /// `namespaces`, using each namespace's bucket override or the defaults.
    pub fn new(namespaces: &[NamespaceConfig]) -> Result<Self> {
        let mut builder = PrometheusBuilder::new();

        // Exact matchers only: overlapping matchers resolve in no fixed order.
        for ns in namespaces {
            let buckets = ns.histogram_buckets.as_deref().unwrap_or(DEFAULT_BUCKETS);
            for family in histogram_families(&ns.name) {
                debug!(metric = %family, ?buckets, "histogram buckets");
                builder = builder
                    .set_buckets_for_metric(Matcher::Full(family), buckets)
                    .map_err(|e| ExporterError::Metrics(e.to_string()))?;
            }
        }

        let recorder = builder.build_recorder();
        let handle = recorder.handle();

        Ok(Self {
            recorder,
            handle,
            documented: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a set of metric families.
    ///
    /// Fails without registering anything when one of the names is already
    /// taken, e.g. by another namespace of the same name.
    pub fn register(&self, docs: Vec<MetricDoc>) -> Result<()> {
        let mut documented = self
            .documented
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(conflict) = docs.iter().find(|doc| documented.contains_key(&doc.name)) {
            return Err(ExporterError::Metrics(format!(
                "metric '{}' is already registered",
                conflict.name
            )));
        }

        for doc in docs {
            let key_name = KeyName::from(doc.name.clone());
            let help = SharedString::from(doc.help);
            match doc.metric_type {
                MetricType::Counter => self.recorder.describe_counter(key_name, None, help),
                MetricType::Summary | MetricType::Histogram => {
                    self.recorder.describe_histogram(key_name, None, help)
                }
            }
            debug!(
                metric = %doc.name,
                kind = ?doc.metric_type,
                labels = doc.labels.len(),
                "registered metric family"
            );
            documented.insert(doc.name.clone(), doc);
        }

        info!(total = documented.len(), "metric families registered");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.documented
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }

    /// Handle to the counter series `name{labels}`, created on first use.
    pub fn counter(&self, name: &str, labels: Vec<Label>) -> Counter {
        let key = Key::from_parts(name.to_string(), labels);
        self.recorder.register_counter(&key, &metadata())
    }

    /// Handle to the distribution series `name{labels}`. Rendered as a
    /// histogram when `name` is a namespace's histogram family, else as a
    /// summary.
    pub fn histogram(&self, name: &str, labels: Vec<Label>) -> Histogram {
        let key = Key::from_parts(name.to_string(), labels);
        self.recorder.register_histogram(&key, &metadata())
    }

    /// Renders all series in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Drains pending distribution samples so they do not accumulate between
    /// scrapes.
    pub fn run_upkeep(&self) {
        self.handle.run_upkeep();
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}
