use std::path::PathBuf;

use thiserror::Error;

use crate::tail::FollowError;
use crate::template::TemplateError;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("experimental feature used without opt-in: {0}")]
    ExperimentalFeature(String),

    #[error("invalid log format for namespace '{namespace}': {source}")]
    Template {
        namespace: String,
        #[source]
        source: TemplateError,
    },

    #[error("invalid relabeling for namespace '{namespace}': {reason}")]
    Relabel { namespace: String, reason: String },

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("metric registration failed: {0}")]
    Metrics(String),

    #[error("failed to follow '{}': {source}", path.display())]
    Follow {
        path: PathBuf,
        #[source]
        source: FollowError,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("service discovery error: {0}")]
    Discovery(String),

    #[error("HTTP server error: {0}")]
    Server(#[from] hyper::Error),
}

impl ExporterError {
    /// Process exit code for a fatal error reaching `main`.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExporterError::ExperimentalFeature(_) => 1,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
