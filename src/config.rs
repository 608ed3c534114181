use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ExporterError, Result};
use crate::template::DEFAULT_FORMAT;

pub const DEFAULT_LISTEN_PORT: u16 = 4040;
pub const DEFAULT_NAMESPACE: &str = "nginx";

/// Startup options that are available as command-line flags.
///
/// When `config_file` is set the file is authoritative and only
/// `enable_experimental` is merged in from the flags.
#[derive(Debug, Clone, Default)]
pub struct StartupFlags {
    pub listen_port: u16,
    pub format: String,
    pub namespace: String,
    pub config_file: Option<PathBuf>,
    pub enable_experimental: bool,
    pub filenames: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub namespaces: Vec<NamespaceConfig>,
    pub enable_experimental: bool,
    pub fatal_scope: FatalScope,
    pub tail: TailConfig,
    pub consul: ConsulConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            namespaces: Vec::new(),
            enable_experimental: false,
            fatal_scope: FatalScope::Process,
            tail: TailConfig::default(),
            consul: ConsulConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_LISTEN_PORT,
        }
    }
}

/// How far a fatal ingestion failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalScope {
    /// Any failing source terminates the whole exporter.
    Process,
    /// A failing source stops only the namespace it belongs to.
    Namespace,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    pub poll_interval_ms: u64,
    pub from_beginning: bool,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            from_beginning: false,
        }
    }
}

impl TailConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub source_files: Vec<PathBuf>,
    /// Static labels, ordered by label name.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub relabel_configs: Vec<RelabelConfig>,
    #[serde(default)]
    pub histogram_buckets: Option<Vec<f64>>,
}

fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

impl NamespaceConfig {
    pub fn new(name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            source_files: Vec::new(),
            labels: BTreeMap::new(),
            relabel_configs: Vec::new(),
            histogram_buckets: None,
        }
    }

    /// Static label names and values in schema order.
    pub fn ordered_labels(&self) -> (Vec<String>, Vec<String>) {
        self.labels
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .unzip()
    }

    /// Names of options in use that are not yet declared stable.
    pub fn stability_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.relabel_configs.is_empty() {
            warnings.push(format!(
                "namespace '{}' uses the 'relabel_configs' option",
                self.name
            ));
        }
        if self.histogram_buckets.is_some() {
            warnings.push(format!(
                "namespace '{}' uses the 'histogram_buckets' option",
                self.name
            ));
        }
        warnings
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelabelConfig {
    pub target_label: String,
    #[serde(rename = "from")]
    pub source_value: String,
    #[serde(default)]
    pub split: usize,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub matches: Vec<RelabelMatch>,
    /// Written when `matches` is configured but no expression matched.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl RelabelConfig {
    pub fn new(target_label: impl Into<String>, source_value: impl Into<String>) -> Self {
        Self {
            target_label: target_label.into(),
            source_value: source_value.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelabelMatch {
    pub regexp: String,
    #[serde(default)]
    pub replacement: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    pub enable: bool,
    pub address: String,
    pub scheme: String,
    pub datacenter: Option<String>,
    pub token: Option<String>,
    pub service: ConsulServiceConfig,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: "localhost:8500".to_string(),
            scheme: "http".to_string(),
            datacenter: None,
            token: None,
            service: ConsulServiceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsulServiceConfig {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    pub tags: Vec<String>,
}

impl Default for ConsulServiceConfig {
    fn default() -> Self {
        Self {
            id: "access-log-exporter".to_string(),
            name: "access-log-exporter".to_string(),
            address: None,
            tags: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the configuration from the file named in `flags`, or builds a
    /// single-namespace configuration from the flags themselves.
    pub fn load(flags: &StartupFlags) -> Result<Self> {
        let mut config = match &flags.config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::from_flags(flags),
        };
        config.enable_experimental |= flags.enable_experimental;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ExporterError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn from_flags(flags: &StartupFlags) -> Self {
        let mut namespace = NamespaceConfig::new(&flags.namespace, &flags.format);
        namespace.source_files = flags.filenames.clone();

        Self {
            listen: ListenConfig {
                port: flags.listen_port,
                ..ListenConfig::default()
            },
            namespaces: vec![namespace],
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespaces.is_empty() {
            return Err(ExporterError::Config("no namespaces configured".into()));
        }

        let mut seen = HashSet::new();
        for ns in &self.namespaces {
            if !is_valid_metric_prefix(&ns.name) {
                return Err(ExporterError::Config(format!(
                    "namespace '{}' is not a valid metric name prefix",
                    ns.name
                )));
            }
            if !seen.insert(ns.name.as_str()) {
                return Err(ExporterError::Config(format!(
                    "namespace '{}' is configured more than once",
                    ns.name
                )));
            }
            if ns.format.trim().is_empty() {
                return Err(ExporterError::Config(format!(
                    "namespace '{}' has an empty format",
                    ns.name
                )));
            }
            if ns.source_files.is_empty() {
                return Err(ExporterError::Config(format!(
                    "namespace '{}' has no source files",
                    ns.name
                )));
            }
            if let Some(buckets) = &ns.histogram_buckets {
                let ascending = buckets.windows(2).all(|w| w[0] < w[1]);
                if buckets.is_empty() || !ascending || buckets.iter().any(|b| !b.is_finite()) {
                    return Err(ExporterError::Config(format!(
                        "namespace '{}' has invalid histogram_buckets (need finite, strictly ascending values)",
                        ns.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Describes every experimental option in use, or `None` when the
    /// configuration only uses stable options.
    pub fn stability_warnings(&self) -> Option<String> {
        let warnings: Vec<String> = self
            .namespaces
            .iter()
            .flat_map(NamespaceConfig::stability_warnings)
            .collect();
        if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("; "))
        }
    }

    /// Fails when experimental options are used without opting in.
    pub fn check_stability(&self) -> Result<()> {
        match self.stability_warnings() {
            Some(warning) if !self.enable_experimental => {
                Err(ExporterError::ExperimentalFeature(warning))
            }
            _ => Ok(()),
        }
    }
}

fn is_valid_metric_prefix(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
enable_experimental = true
fatal_scope = "namespace"

[listen]
port = 9113

[tail]
poll_interval_ms = 50
from_beginning = true

[consul]
enable = true
datacenter = "dc1"
[consul.service]
id = "exporter-1"
name = "nginx-exporter"
tags = ["edge"]

[[namespaces]]
name = "app_1"
format = "$remote_addr \"$request\" $status $request_time"
source_files = ["/var/log/nginx/app1.log", "/var/log/nginx/app1-extra.log"]
histogram_buckets = [0.1, 0.5, 1.0]

[namespaces.labels]
zone = "eu"
app = "magicapp"

[[namespaces.relabel_configs]]
target_label = "request_uri"
from = "request"
split = 2

[[namespaces.relabel_configs.matches]]
regexp = "^/users/[0-9]+"
replacement = "/users/:id"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(FULL_CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.listen.port, 9113);
        assert_eq!(config.listen.address, "0.0.0.0");
        assert_eq!(config.fatal_scope, FatalScope::Namespace);
        assert_eq!(config.tail.poll_interval(), Duration::from_millis(50));
        assert!(config.consul.enable);
        assert_eq!(config.consul.address, "localhost:8500");
        assert_eq!(config.consul.service.tags, vec!["edge".to_string()]);

        let ns = &config.namespaces[0];
        assert_eq!(ns.source_files.len(), 2);
        let (names, values) = ns.ordered_labels();
        assert_eq!(names, vec!["app", "zone"]);
        assert_eq!(values, vec!["magicapp", "eu"]);

        let relabel = &ns.relabel_configs[0];
        assert_eq!(relabel.source_value, "request");
        assert_eq!(relabel.split, 2);
        assert_eq!(relabel.matches[0].replacement, "/users/:id");
    }

    #[test]
    fn test_defaults_for_minimal_file() {
        let config = Config::from_toml(
            r#"
[[namespaces]]
name = "nginx"
source_files = ["/var/log/nginx/access.log"]
"#,
        )
        .unwrap();

        assert_eq!(config.listen.port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.fatal_scope, FatalScope::Process);
        assert!(!config.tail.from_beginning);
        assert_eq!(config.namespaces[0].format, DEFAULT_FORMAT);
        assert!(config.stability_warnings().is_none());
        config.check_stability().unwrap();
    }

    #[test]
    fn test_from_flags() {
        let flags = StartupFlags {
            listen_port: 4041,
            format: "$status".to_string(),
            namespace: "web".to_string(),
            config_file: None,
            enable_experimental: false,
            filenames: vec![PathBuf::from("/tmp/access.log")],
        };

        let config = Config::load(&flags).unwrap();
        assert_eq!(config.listen.port, 4041);
        assert_eq!(config.namespaces.len(), 1);
        assert_eq!(config.namespaces[0].name, "web");
        assert_eq!(config.namespaces[0].format, "$status");
    }

    #[test]
    fn test_config_file_wins_over_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exporter.toml");
        fs::write(
            &path,
            r#"
[[namespaces]]
name = "from_file"
source_files = ["/var/log/a.log"]
"#,
        )
        .unwrap();

        let flags = StartupFlags {
            listen_port: 1,
            format: "$status".to_string(),
            namespace: "from_flags".to_string(),
            config_file: Some(path),
            enable_experimental: true,
            filenames: vec![PathBuf::from("/var/log/b.log")],
        };

        let config = Config::load(&flags).unwrap();
        assert_eq!(config.namespaces[0].name, "from_file");
        assert_eq!(config.listen.port, DEFAULT_LISTEN_PORT);
        assert!(config.enable_experimental);
    }

    #[test]
    fn test_experimental_options_need_opt_in() {
        let mut config = Config::from_toml(FULL_CONFIG).unwrap();
        config.enable_experimental = false;

        let err = config.check_stability().unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("relabel_configs"));
        assert!(err.to_string().contains("histogram_buckets"));

        config.enable_experimental = true;
        config.check_stability().unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::from_toml(FULL_CONFIG).unwrap();
        config.namespaces[0].name = "1bad-name".to_string();
        assert!(matches!(config.validate(), Err(ExporterError::Config(_))));

        let mut config = Config::from_toml(FULL_CONFIG).unwrap();
        let duplicate = config.namespaces[0].clone();
        config.namespaces.push(duplicate);
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(FULL_CONFIG).unwrap();
        config.namespaces[0].source_files.clear();
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(FULL_CONFIG).unwrap();
        config.namespaces[0].histogram_buckets = Some(vec![1.0, 0.5]);
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::from_file(Path::new("/nonexistent/exporter.toml")).unwrap_err();
        assert!(matches!(err, ExporterError::Config(_)));
    }
}
