//! Component assembly, wiring, and lifecycle management.
//!
//! The [`Orchestrator`] loads configuration, brings up the rule engine and
//! the initial rule set, builds the inspection stage, and pumps NDJSON
//! records between the outside world and the stage.
//!
//! # Startup Order
//!
//! 1. Engine supervisor (binding created, version checked)
//! 2. Initial rule set (read, merged, compiled, activated)
//! 3. Inspection stage (dispatcher and correlator sweeper)
//! 4. Rule reloader (periodic bundle checks)
//!
//! # Shutdown Order
//!
//! 1. Input intake stops (EOF or signal)
//! 2. Rule reloader
//! 3. Inspection stage (queue drained, engine drained, held spans flushed)
//! 4. Record writer (finishes once the last record sender is gone)

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use semver::VersionReq;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::sync::{broadcast, mpsc};

use ocinspect_core::config::OcInspectConfig;
use ocinspect_core::pipeline::Pipeline;
use ocinspect_core::record::CorrelatedRecord;
use ocinspect_engine::{EngineBinding, SecLangEngine, check_version};
use ocinspect_pipeline::{
    EngineSupervisor, InspectionStage, InspectionStageBuilder, PipelineConfig, RuleReloader,
};

use crate::health::{self, ComponentHealth, DaemonHealth, aggregate_status};
use crate::metrics_server;
use crate::records::{self, InboundRecord};

/// How often the uptime gauge is refreshed.
const UPTIME_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Counters reported when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Non-empty input lines read.
    pub records_read: u64,
    /// Lines that could not be parsed and were skipped.
    pub malformed: u64,
    /// Correlated records written.
    pub records_written: u64,
}

/// The main daemon orchestrator.
pub struct Orchestrator {
    config: OcInspectConfig,
    supervisor: Arc<EngineSupervisor<SecLangEngine>>,
    stage: InspectionStage<SecLangEngine>,
    reloader: RuleReloader<SecLangEngine>,
    record_rx: mpsc::Receiver<CorrelatedRecord>,
    start_time: Instant,
}

impl Orchestrator {
    /// Load `ocinspect.toml` (with environment overrides) and build.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or is invalid,
    /// the engine cannot be created, or the initial rule bundle is rejected.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = OcInspectConfig::load(config_path)
            .await
            .with_context(|| format!("failed to load config {}", config_path.display()))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    ///
    /// There is no previous rule set to fall back to at startup, so a
    /// rejected initial bundle fails the build.
    pub async fn build_from_config(config: OcInspectConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let requirement = VersionReq::parse(&config.engine.version_req)
            .context("invalid engine.version_req")?;
        let supervisor = Arc::new(
            EngineSupervisor::with_factory(SecLangEngine::new)
                .map_err(|e| anyhow::anyhow!("failed to create rule engine: {}", e))?,
        );
        let info = supervisor.binding().info();
        check_version(&info, &requirement)?;
        tracing::info!(
            binding = %info.name,
            version = %info.version,
            requirement = %requirement,
            "rule engine created"
        );

        let pipeline_config = PipelineConfig::from_core(&config);
        pipeline_config.validate()?;

        let reloader = RuleReloader::from_config(Arc::clone(&supervisor), &pipeline_config);
        let rule_set = reloader
            .load_initial()
            .await
            .context("failed to load initial rule set")?;
        tracing::info!(
            version = %rule_set.version(),
            rules = rule_set.rule_count(),
            "initial rule set active"
        );

        let (stage, record_rx) = InspectionStageBuilder::new()
            .config(pipeline_config)
            .supervisor(Arc::clone(&supervisor))
            .build()?;
        let record_rx =
            record_rx.ok_or_else(|| anyhow::anyhow!("inspection stage has no record output"))?;

        record_build_info();

        Ok(Self {
            config,
            supervisor,
            stage,
            reloader,
            record_rx,
            start_time: Instant::now(),
        })
    }

    /// Run until the input is exhausted or SIGTERM/SIGINT arrives.
    ///
    /// `input`/`output` default to stdin/stdout.
    pub async fn run(self, input: Option<PathBuf>, output: Option<PathBuf>) -> Result<RunSummary> {
        let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
            Some(path) => Box::new(BufReader::new(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("failed to open input {}", path.display()))?,
            )),
            None => Box::new(BufReader::new(tokio::io::stdin())),
        };
        let writer: Box<dyn AsyncWrite + Unpin + Send> = match &output {
            Some(path) => Box::new(
                tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("failed to create output {}", path.display()))?,
            ),
            None => Box::new(tokio::io::stdout()),
        };

        let shutdown = shutdown_signal()?;
        let (summary, _writer) = self.run_with(reader, writer, shutdown).await?;
        Ok(summary)
    }

    /// Run with explicit streams and shutdown trigger.
    ///
    /// Returns the summary and the output writer once every record has
    /// been written.
    pub async fn run_with<R, W, S>(
        self,
        input: R,
        output: W,
        shutdown: S,
    ) -> Result<(RunSummary, W)>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ()>,
    {
        let Self {
            config,
            supervisor,
            mut stage,
            mut reloader,
            record_rx,
            start_time,
        } = self;

        let writer = records::spawn_record_writer(record_rx, output);
        let health_watcher = health::spawn_health_watcher(supervisor.subscribe_health());
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let uptime_task = config
            .metrics
            .enabled
            .then(|| spawn_uptime_updater(start_time, shutdown_tx.subscribe()));

        stage
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start inspection stage: {}", e))?;
        if let Err(e) = reloader.start().await {
            tracing::warn!("startup failed, stopping inspection stage");
            if let Err(stop_err) = stage.stop().await {
                tracing::error!(
                    startup_error = %e,
                    rollback_error = %stop_err,
                    "rollback also failed during startup failure cleanup"
                );
            }
            return Err(anyhow::anyhow!("failed to start rule reloader: {}", e));
        }
        tracing::info!("ocinspect-daemon running");

        let summary = pump(&stage, input, shutdown).await;

        let _ = shutdown_tx.send(());
        if let Some(task) = uptime_task {
            let _ = task.await;
        }

        if let Err(e) = reloader.stop().await {
            tracing::error!(error = %e, "failed to stop rule reloader");
        }
        if let Err(e) = stage.stop().await {
            tracing::error!(error = %e, "failed to stop inspection stage");
        }

        // the stage owns the last record sender and the last supervisor references
        drop(stage);
        drop(reloader);
        drop(supervisor);

        let (output, written) = writer
            .await
            .context("record writer task failed")?
            .context("failed to write correlated records")?;
        health_watcher.abort();

        let summary = RunSummary {
            records_written: written,
            ..summary
        };
        tracing::info!(
            records_read = summary.records_read,
            malformed = summary.malformed,
            records_written = summary.records_written,
            uptime_secs = start_time.elapsed().as_secs(),
            "ocinspect-daemon stopped"
        );
        Ok((summary, output))
    }

    /// Current aggregated health.
    pub async fn health(&self) -> DaemonHealth {
        let components = vec![
            ComponentHealth::new("engine", self.supervisor.health()),
            ComponentHealth::new("inspection-stage", self.stage.health_check().await),
            ComponentHealth::new("rule-reloader", self.reloader.health_check().await),
        ];
        DaemonHealth {
            status: aggregate_status(&components),
            uptime_secs: self.start_time.elapsed().as_secs(),
            components,
        }
    }

    /// The loaded configuration.
    pub fn config(&self) -> &OcInspectConfig {
        &self.config
    }

    /// The engine supervisor.
    pub fn supervisor(&self) -> &Arc<EngineSupervisor<SecLangEngine>> {
        &self.supervisor
    }
}

/// Feed input lines into the stage until EOF, a read error, or shutdown.
async fn pump<R, S>(stage: &InspectionStage<SecLangEngine>, input: R, shutdown: S) -> RunSummary
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut summary = RunSummary::default();
    let sender = stage.transaction_sender();
    let correlator = stage.correlator();
    let mut lines = input.lines();
    tokio::pin!(shutdown);

    loop {
        let next = tokio::select! {
            biased;
            () = &mut shutdown => {
                tracing::info!("shutdown requested, closing input");
                break;
            }
            next = lines.next_line() => next,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("input exhausted");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to read input, closing");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        summary.records_read += 1;

        let record = match InboundRecord::parse(&line) {
            Ok(record) => record,
            Err(e) => {
                summary.malformed += 1;
                tracing::warn!(line = summary.records_read, error = %e, "skipping malformed record");
                continue;
            }
        };

        if let Some(span) = record.span
            && let Err(e) = correlator.register_span(span).await
        {
            tracing::warn!(error = %e, "failed to register span");
        }
        if sender.send(record.transaction).await.is_err() {
            tracing::error!("inspection stage stopped accepting transactions");
            break;
        }
    }

    summary
}

/// Install SIGTERM/SIGINT handlers and return a future that resolves on
/// the first of them.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    Ok(async move {
        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "shutdown signal received");
    })
}

fn record_build_info() {
    use ocinspect_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "daemon metrics recorded");
}

fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    use ocinspect_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS)
                        .set(start_time.elapsed().as_secs() as f64);
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}
