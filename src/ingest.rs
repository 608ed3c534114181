//! The per-source ingestion loop.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExporterError, Result};
use crate::metrics::NamespaceMetrics;
use crate::relabel::RelabelPipeline;
use crate::tail::LineSource;
use crate::template::LineTemplate;

/// What happened to a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Recorded,
    ParseError,
}

/// Why a loop left the running state without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The source closed.
    SourceClosed,
    /// Shutdown was requested; every line read so far has been recorded.
    Cancelled,
}

/// Turns lines into metric updates for one namespace. Shared by all of the
/// namespace's ingestion tasks.
pub struct LineProcessor {
    namespace: String,
    template: LineTemplate,
    pipeline: RelabelPipeline,
    metrics: Arc<NamespaceMetrics>,
}

impl LineProcessor {
    pub fn new(
        namespace: impl Into<String>,
        template: LineTemplate,
        pipeline: RelabelPipeline,
        metrics: Arc<NamespaceMetrics>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            template,
            pipeline,
            metrics,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn process_line(&self, line: &str) -> LineOutcome {
        match self.template.parse(line) {
            Ok(record) => {
                let labels = self.pipeline.apply(&record);
                self.metrics.observe(&labels, &record);
                LineOutcome::Recorded
            }
            Err(e) => {
                self.metrics.parse_error();
                warn!(namespace = %self.namespace, error = %e, line, "error while parsing line");
                LineOutcome::ParseError
            }
        }
    }

    /// Pulls lines from `source` until it closes or `cancel` fires.
    ///
    /// A terminal error from the source is returned to the caller; it is
    /// never swallowed, since a silently stalled source would keep exposing
    /// stale but healthy-looking metrics.
    pub async fn run(
        &self,
        origin: PathBuf,
        source: &mut (dyn LineSource + '_),
        cancel: &CancellationToken,
    ) -> Result<LoopExit> {
        debug!(namespace = %self.namespace, source = %origin.display(), "ingestion loop started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(namespace = %self.namespace, source = %origin.display(), "ingestion loop cancelled");
                    return Ok(LoopExit::Cancelled);
                }
                next = source.next_line() => next,
            };

            match next {
                Ok(Some(line)) => {
                    self.process_line(&line);
                }
                Ok(None) => {
                    debug!(namespace = %self.namespace, source = %origin.display(), "source closed");
                    return Ok(LoopExit::SourceClosed);
                }
                Err(error) => {
                    return Err(ExporterError::Follow {
                        path: origin,
                        source: error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::tail::{ChannelSource, FollowError};

    fn processor(registry: &Arc<MetricsRegistry>) -> LineProcessor {
        let template = LineTemplate::compile("$status $request_time").unwrap();
        let pipeline = RelabelPipeline::compile("test", &[], &[], &[]).unwrap();
        let metrics = NamespaceMetrics::register(registry.clone(), "test", pipeline.schema().clone())
            .unwrap();
        LineProcessor::new("test", template, pipeline, Arc::new(metrics))
    }

    #[test]
    fn test_process_line_outcomes() {
        let registry = Arc::new(MetricsRegistry::new(&[]).unwrap());
        let processor = processor(&registry);

        assert_eq!(processor.process_line("200 0.1"), LineOutcome::Recorded);
        assert_eq!(processor.process_line(""), LineOutcome::ParseError);
    }

    #[tokio::test]
    async fn test_run_stops_when_source_closes() {
        let registry = Arc::new(MetricsRegistry::new(&[]).unwrap());
        let processor = processor(&registry);
        let (tx, mut source) = ChannelSource::channel(8);

        tx.send(Ok("200 0.1".to_string())).await.unwrap();
        drop(tx);

        let exit = processor
            .run(PathBuf::from("mem"), &mut source, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit, LoopExit::SourceClosed);
        assert!(registry
            .render()
            .contains("test_http_response_count_total{method=\"\",status=\"200\"} 1"));
    }

    #[tokio::test]
    async fn test_run_returns_terminal_error() {
        let registry = Arc::new(MetricsRegistry::new(&[]).unwrap());
        let processor = processor(&registry);
        let (tx, mut source) = ChannelSource::channel(8);

        tx.send(Err(FollowError::Read(std::io::Error::other("gone"))))
            .await
            .unwrap();

        let err = processor
            .run(PathBuf::from("/var/log/app.log"), &mut source, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExporterError::Follow { .. }));
        assert!(err.to_string().contains("/var/log/app.log"));
    }

    #[tokio::test]
    async fn test_run_exits_on_cancel() {
        let registry = Arc::new(MetricsRegistry::new(&[]).unwrap());
        let processor = processor(&registry);
        let (_tx, mut source) = ChannelSource::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let exit = processor
            .run(PathBuf::from("mem"), &mut source, &cancel)
            .await
            .unwrap();
        assert_eq!(exit, LoopExit::Cancelled);
    }
}
