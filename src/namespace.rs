//! Namespace setup: compile, register, and start one ingestion task per
//! source file.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::NamespaceConfig;
use crate::error::{ExporterError, Result};
use crate::ingest::{LineProcessor, LoopExit};
use crate::metrics::{MetricsRegistry, NamespaceMetrics};
use crate::relabel::RelabelPipeline;
use crate::shutdown::ShutdownCoordinator;
use crate::tail::{FileFollower, LineSource, TailOptions};
use crate::template::LineTemplate;

/// A fatal error reported by an ingestion task.
#[derive(Debug)]
pub struct TaskFailure {
    pub namespace: String,
    pub error: ExporterError,
}

pub type FailureSender = mpsc::UnboundedSender<TaskFailure>;

pub struct NamespaceProcessor {
    config: NamespaceConfig,
    processor: Arc<LineProcessor>,
}

impl NamespaceProcessor {
    /// Compiles the template and relabeling pipeline and registers the
    /// namespace's metrics. Any error here must stop startup.
    pub fn compile(config: &NamespaceConfig, registry: &Arc<MetricsRegistry>) -> Result<Self> {
        let template = LineTemplate::compile(&config.format).map_err(|source| {
            ExporterError::Template {
                namespace: config.name.clone(),
                source,
            }
        })?;

        let (static_names, static_values) = config.ordered_labels();
        let pipeline = RelabelPipeline::compile(
            &config.name,
            &static_names,
            &static_values,
            &config.relabel_configs,
        )?;

        let metrics = NamespaceMetrics::register(
            registry.clone(),
            &config.name,
            pipeline.schema().clone(),
        )?;

        info!(
            namespace = %config.name,
            labels = ?pipeline.schema().names(),
            fields = ?template.fields(),
            "namespace compiled"
        );

        Ok(Self {
            config: config.clone(),
            processor: Arc::new(LineProcessor::new(
                config.name.clone(),
                template,
                pipeline,
                Arc::new(metrics),
            )),
        })
    }

    pub fn processor(&self) -> &Arc<LineProcessor> {
        &self.processor
    }

    /// Opens every configured source file and starts following them.
    ///
    /// All files are opened before any task is spawned, so a namespace
    /// either starts completely or not at all. Returns the token that stops
    /// only this namespace.
    pub async fn start(
        &self,
        coordinator: &ShutdownCoordinator,
        options: TailOptions,
        failures: FailureSender,
    ) -> Result<CancellationToken> {
        let mut sources: Vec<(PathBuf, Box<dyn LineSource>)> =
            Vec::with_capacity(self.config.source_files.len());

        for path in &self.config.source_files {
            let follower = FileFollower::open(path, options)
                .await
                .map_err(|source| ExporterError::Follow {
                    path: path.clone(),
                    source,
                })?;
            sources.push((path.clone(), Box::new(follower)));
        }

        Ok(self.spawn_sources(sources, coordinator, failures))
    }

    /// Spawns one tracked ingestion task per source. Each task runs until
    /// its source closes, the namespace token is cancelled, or the source
    /// fails; failures are sent to `failures`.
    pub fn spawn_sources(
        &self,
        sources: Vec<(PathBuf, Box<dyn LineSource>)>,
        coordinator: &ShutdownCoordinator,
        failures: FailureSender,
    ) -> CancellationToken {
        let cancel = coordinator.child_token();

        for (origin, mut source) in sources {
            let processor = self.processor.clone();
            let cancel = cancel.clone();
            let failures = failures.clone();

            info!(namespace = %self.config.name, source = %origin.display(), "starting listener");

            coordinator.spawn("ingestion", async move {
                let source_name = origin.display().to_string();
                match processor.run(origin, source.as_mut(), &cancel).await {
                    Ok(LoopExit::SourceClosed) => {
                        info!(namespace = %processor.namespace(), source = %source_name, "source closed, listener stopped");
                    }
                    Ok(LoopExit::Cancelled) => {}
                    Err(error) => {
                        error!(namespace = %processor.namespace(), source = %source_name, error = %error, "listener failed");
                        let failure = TaskFailure {
                            namespace: processor.namespace().to_string(),
                            error,
                        };
                        if failures.send(failure).is_err() {
                            error!(namespace = %processor.namespace(), "no supervisor to report the failure to");
                        }
                    }
                }
            });
        }

        cancel
    }
}
