pub mod app;
pub mod config;
pub mod discovery;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod namespace;
pub mod relabel;
pub mod server;
pub mod shutdown;
pub mod tail;
pub mod template;
