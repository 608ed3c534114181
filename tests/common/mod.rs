#![allow(dead_code)]

use std::sync::Arc;

use access_log_exporter::config::NamespaceConfig;
use access_log_exporter::metrics::MetricsRegistry;
use access_log_exporter::namespace::NamespaceProcessor;

/// Template used by the integration tests.
pub const FORMAT: &str =
    r#"$remote_addr "$request" $status $body_bytes_sent $request_time $upstream_response_time"#;

pub fn namespace_config(name: &str) -> NamespaceConfig {
    NamespaceConfig::new(name, FORMAT)
}

pub fn compile(config: &NamespaceConfig) -> anyhow::Result<(Arc<MetricsRegistry>, NamespaceProcessor)> {
    let registry = Arc::new(MetricsRegistry::new(std::slice::from_ref(config))?);
    let processor = NamespaceProcessor::compile(config, &registry)?;
    Ok((registry, processor))
}

/// Looks up one sample in Prometheus text exposition output. `labels`
/// must list every label of the sample, in any order.
pub fn sample(text: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    let mut wanted: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    wanted.sort();

    text.lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .find_map(|line| {
            let (series, value) = line.rsplit_once(' ')?;
            let (metric, mut found) = match series.split_once('{') {
                Some((metric, rest)) => (metric, parse_labels(rest.strip_suffix('}')?)),
                None => (series, Vec::new()),
            };
            found.sort();
            if metric == name && found == wanted {
                value.parse().ok()
            } else {
                None
            }
        })
}

fn parse_labels(body: &str) -> Vec<(String, String)> {
    let mut labels = Vec::new();
    let mut rest = body;
    while let Some((key, after)) = rest.split_once("=\"") {
        let Some(end) = after.find('"') else {
            break;
        };
        labels.push((key.trim_start_matches(',').to_string(), after[..end].to_string()));
        rest = &after[end + 1..];
    }
    labels
}

/// A log line in [`FORMAT`].
pub fn line(request: &str, status: u16, bytes: &str, request_time: &str, upstream_time: &str) -> String {
    format!(r#"10.0.0.1 "{request}" {status} {bytes} {request_time} {upstream_time}"#)
}
