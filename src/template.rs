//! Field extraction from access-log lines.
//!
//! A template is an nginx `log_format` string such as
//! `$remote_addr - $remote_user [$time_local] "$request" $status`. Each
//! `$variable` becomes a named capture group that matches everything up to
//! the literal character following it in the template.

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

/// The nginx `combined` format, used when no template is configured.
pub const DEFAULT_FORMAT: &str = r#"$remote_addr - $remote_user [$time_local] "$request" $status $body_bytes_sent "$http_referer" "$http_user_agent" "$http_x_forwarded_for""#;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template contains no $variable placeholders")]
    NoFields,

    #[error("field '${0}' appears more than once")]
    DuplicateField(String),

    #[error("template does not compile to a valid expression: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("line does not match the log format")]
    Mismatch,
}

/// A compiled log-line template. Parsing is stateless and safe to share.
#[derive(Debug, Clone)]
pub struct LineTemplate {
    regex: Regex,
    fields: Vec<String>,
}

impl LineTemplate {
    pub fn compile(format: &str) -> Result<Self, TemplateError> {
        let placeholder = Regex::new(r"\$([A-Za-z0-9_]+)")?;

        let mut pattern = String::from("^");
        let mut fields: Vec<String> = Vec::new();
        let mut last = 0;

        for caps in placeholder.captures_iter(format) {
            let (whole, name) = match (caps.get(0), caps.get(1)) {
                (Some(whole), Some(name)) => (whole, name.as_str()),
                _ => continue,
            };
            if fields.iter().any(|f| f == name) {
                return Err(TemplateError::DuplicateField(name.to_string()));
            }

            pattern.push_str(&regex::escape(&format[last..whole.start()]));
            match format[whole.end()..].chars().next() {
                Some(delimiter) => {
                    let class = regex::escape(&delimiter.to_string());
                    pattern.push_str(&format!("(?P<{name}>[^{class}]*)"));
                }
                None => pattern.push_str(&format!("(?P<{name}>.*)")),
            }

            fields.push(name.to_string());
            last = whole.end();
        }

        if fields.is_empty() {
            return Err(TemplateError::NoFields);
        }

        pattern.push_str(&regex::escape(&format[last..]));
        pattern.push('$');

        Ok(Self {
            regex: Regex::new(&pattern)?,
            fields,
        })
    }

    /// Names of the fields this template extracts, in template order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn parse(&self, line: &str) -> Result<Record, ParseError> {
        let caps = self.regex.captures(line).ok_or(ParseError::Mismatch)?;

        let values = self
            .fields
            .iter()
            .filter_map(|name| {
                caps.name(name)
                    .map(|m| (name.clone(), m.as_str().to_string()))
            })
            .collect();

        Ok(Record { values })
    }
}

/// Named field values extracted from a single line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: HashMap<String, String>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Numeric value of a field. Absent, non-numeric (including nginx's `-`)
    /// and non-finite values all read as `None`.
    pub fn float_field(&self, name: &str) -> Option<f64> {
        self.field(name)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMBINED_LINE: &str = r#"172.17.0.1 - - [23/Jun/2016:16:04:20 +0000] "GET /users/42 HTTP/1.1" 200 612 "-" "curl/7.29.0" "-""#;

    #[test]
    fn test_parse_combined_format() {
        let template = LineTemplate::compile(DEFAULT_FORMAT).unwrap();
        let record = template.parse(COMBINED_LINE).unwrap();

        assert_eq!(record.field("remote_addr"), Some("172.17.0.1"));
        assert_eq!(record.field("time_local"), Some("23/Jun/2016:16:04:20 +0000"));
        assert_eq!(record.field("request"), Some("GET /users/42 HTTP/1.1"));
        assert_eq!(record.field("status"), Some("200"));
        assert_eq!(record.float_field("body_bytes_sent"), Some(612.0));
        assert_eq!(record.field("http_user_agent"), Some("curl/7.29.0"));
        assert_eq!(record.len(), 9);
    }

    #[test]
    fn test_trailing_field_takes_rest_of_line() {
        let template = LineTemplate::compile("$status $request_time").unwrap();
        let record = template.parse("503 0.125").unwrap();

        assert_eq!(record.field("status"), Some("503"));
        assert_eq!(record.float_field("request_time"), Some(0.125));
    }

    #[test]
    fn test_mismatch_is_an_error() {
        let template = LineTemplate::compile(r#"$status "$request""#).unwrap();
        assert_eq!(template.parse("garbage"), Err(ParseError::Mismatch));
    }

    #[test]
    fn test_literal_metacharacters_are_escaped() {
        let template = LineTemplate::compile("[$time_local] (*) $status").unwrap();
        let record = template.parse("[now] (*) 404").unwrap();
        assert_eq!(record.field("status"), Some("404"));
        assert!(template.parse("[now] (x) 404").is_err());
    }

    #[test]
    fn test_duplicate_and_empty_templates_rejected() {
        assert!(matches!(
            LineTemplate::compile("$status $status"),
            Err(TemplateError::DuplicateField(name)) if name == "status"
        ));
        assert!(matches!(
            LineTemplate::compile("no placeholders here"),
            Err(TemplateError::NoFields)
        ));
    }

    #[test]
    fn test_float_field_rejects_placeholders_and_text() {
        let record: Record = [("upstream_response_time", "-"), ("request_time", "abc"), ("bytes", "NaN")]
            .into_iter()
            .collect();

        assert_eq!(record.float_field("upstream_response_time"), None);
        assert_eq!(record.float_field("request_time"), None);
        assert_eq!(record.float_field("bytes"), None);
        assert_eq!(record.float_field("missing"), None);
    }
}
