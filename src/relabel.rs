//! Relabeling: maps extracted log fields onto metric label values.
//!
//! A namespace compiles its static labels and relabel rules once into a
//! [`RelabelPipeline`]. The pipeline owns the [`LabelSchema`] shared by every
//! labeled metric of the namespace and turns each parsed [`Record`] into a
//! fresh [`LabelVector`].

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;

use crate::config::RelabelConfig;
use crate::error::{ExporterError, Result};
use crate::template::Record;

/// Value written by a whitelist rule when the source value is not listed.
pub const WHITELIST_OTHER: &str = "other";

const DEFAULT_SEPARATOR: &str = " ";

/// Built-in rules, evaluated before any user rule:
///
/// * `method` is the first space-separated word of `request`,
/// * `status` is copied from `status`.
pub fn default_relabel_configs() -> Vec<RelabelConfig> {
    vec![
        RelabelConfig {
            split: 1,
            separator: Some(DEFAULT_SEPARATOR.to_string()),
            ..RelabelConfig::new("method", "request")
        },
        RelabelConfig::new("status", "status"),
    ]
}

#[derive(Debug, Clone)]
struct CompiledMatch {
    regex: Regex,
    replacement: String,
}

/// A single compiled rule.
#[derive(Debug, Clone)]
pub struct Relabeling {
    source: String,
    target: String,
    split: usize,
    separator: String,
    whitelist: Option<HashSet<String>>,
    matches: Vec<CompiledMatch>,
    fallback: Option<String>,
}

impl Relabeling {
    pub fn compile(config: &RelabelConfig) -> Result<Self> {
        let matches = config
            .matches
            .iter()
            .map(|m| {
                Ok(CompiledMatch {
                    regex: Regex::new(&m.regexp)?,
                    replacement: m.replacement.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source: config.source_value.clone(),
            target: config.target_label.clone(),
            split: config.split,
            separator: config
                .separator
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string()),
            whitelist: config
                .whitelist
                .as_ref()
                .map(|values| values.iter().cloned().collect()),
            matches,
            fallback: config.fallback.clone(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Maps a source value to a label value. `None` means the rule did not
    /// produce a value for this line.
    pub fn map(&self, value: &str) -> Option<String> {
        let value = if self.split > 0 {
            value
                .split(self.separator.as_str())
                .nth(self.split - 1)
                .unwrap_or("")
        } else {
            value
        };

        if let Some(whitelist) = &self.whitelist {
            return Some(if whitelist.contains(value) {
                value.to_string()
            } else {
                WHITELIST_OTHER.to_string()
            });
        }

        if !self.matches.is_empty() {
            return self
                .matches
                .iter()
                .find(|m| m.regex.is_match(value))
                .map(|m| m.regex.replace_all(value, m.replacement.as_str()).into_owned())
                .or_else(|| self.fallback.clone());
        }

        Some(value.to_string())
    }
}

/// The ordered label names shared by every labeled metric of a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSchema {
    names: Vec<String>,
    static_count: usize,
}

impl LabelSchema {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of leading names that carry static values.
    pub fn static_count(&self) -> usize {
        self.static_count
    }
}

/// One line's label values, positionally aligned with a [`LabelSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelVector(Vec<String>);

impl LabelVector {
    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug)]
pub struct RelabelPipeline {
    schema: Arc<LabelSchema>,
    static_values: Vec<String>,
    rules: Vec<(usize, Relabeling)>,
}

impl RelabelPipeline {
    /// Compiles the built-in defaults followed by `user_rules`.
    pub fn compile(
        namespace: &str,
        static_names: &[String],
        static_values: &[String],
        user_rules: &[RelabelConfig],
    ) -> Result<Self> {
        let fail = |reason: String| ExporterError::Relabel {
            namespace: namespace.to_string(),
            reason,
        };

        if static_names.len() != static_values.len() {
            return Err(fail("static label names and values differ in length".into()));
        }

        let mut names: Vec<String> = Vec::with_capacity(static_names.len() + user_rules.len() + 2);
        for name in static_names {
            validate_label_name(name).map_err(&fail)?;
            if names.contains(name) {
                return Err(fail(format!("static label '{name}' is defined twice")));
            }
            names.push(name.clone());
        }
        let static_count = names.len();

        let mut rules = Vec::new();
        for config in default_relabel_configs().iter().chain(user_rules) {
            let rule = Relabeling::compile(config)?;
            validate_label_name(rule.target()).map_err(&fail)?;

            let slot = match names.iter().position(|n| n == rule.target()) {
                Some(pos) if pos < static_count => {
                    return Err(fail(format!(
                        "target label '{}' collides with a static label",
                        rule.target()
                    )));
                }
                Some(pos) => pos,
                None => {
                    names.push(rule.target().to_string());
                    names.len() - 1
                }
            };
            rules.push((slot, rule));
        }

        Ok(Self {
            schema: Arc::new(LabelSchema {
                names,
                static_count,
            }),
            static_values: static_values.to_vec(),
            rules,
        })
    }

    pub fn schema(&self) -> &Arc<LabelSchema> {
        &self.schema
    }

    /// Builds the label vector for one parsed line. Every call starts from
    /// the static values and empty rule slots, so nothing carries over from
    /// a previous line.
    pub fn apply(&self, record: &Record) -> LabelVector {
        let mut values = Vec::with_capacity(self.schema.len());
        values.extend(self.static_values.iter().cloned());
        values.resize(self.schema.len(), String::new());

        for (slot, rule) in &self.rules {
            let Some(raw) = record.field(rule.source()) else {
                continue;
            };
            if let Some(mapped) = rule.map(raw) {
                values[*slot] = mapped;
            }
        }

        LabelVector(values)
    }
}

fn validate_label_name(name: &str) -> std::result::Result<(), String> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid {
        return Err(format!("'{name}' is not a valid label name"));
    }
    if name.starts_with("__") {
        return Err(format!("label name '{name}' is reserved"));
    }
    if name == "le" || name == "quantile" {
        return Err(format!(
            "label name '{name}' is reserved for histogram and summary series"
        ));
    }
    Ok(())
}
