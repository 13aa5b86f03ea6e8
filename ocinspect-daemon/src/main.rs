use anyhow::Result;
use clap::Parser;

use ocinspect_core::config::OcInspectConfig;
use ocinspect_daemon::cli::DaemonCli;
use ocinspect_daemon::logging;
use ocinspect_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = OcInspectConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", cli.config.display(), e))?;
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    logging::init_tracing(&config.general)?;

    tracing::info!(
        config = %cli.config.display(),
        version = env!("CARGO_PKG_VERSION"),
        "ocinspect-daemon starting"
    );

    if cli.validate {
        config.metrics.enabled = false;
        let orchestrator = Orchestrator::build_from_config(config).await?;
        let rule_set = orchestrator.supervisor().current_rule_set();
        tracing::info!(
            version = %rule_set.as_ref().map(|r| r.version()).unwrap_or_default(),
            rules = rule_set.as_ref().map_or(0, |r| r.rule_count()),
            "configuration and rule bundle are valid"
        );
        return Ok(());
    }

    let orchestrator = Orchestrator::build_from_config(config).await?;
    let summary = orchestrator.run(cli.input, cli.output).await?;
    if summary.malformed > 0 {
        tracing::warn!(malformed = summary.malformed, "some input records were skipped");
    }
    Ok(())
}
