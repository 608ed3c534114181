//! Metrics infrastructure for the exporter.
//!
//! All series live in one explicit [`MetricsRegistry`]; nothing is recorded
//! through a global recorder. Each namespace owns a [`NamespaceMetrics`]
//! aggregator that documents its metric families with the registry once and
//! then records into them from any number of ingestion tasks.

pub mod namespace;
pub mod registry;

pub use namespace::NamespaceMetrics;
pub use registry::MetricsRegistry;

/// Suffix of the histogram twin of every summary family.
pub const HISTOGRAM_SUFFIX: &str = "_hist";

/// Prometheus client default buckets, in seconds.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Documentation for a single metric family
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDoc {
    pub name: String,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Summary,
    Histogram,
}

/// Full family name: `{namespace}_{name}`.
pub fn family_name(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}
