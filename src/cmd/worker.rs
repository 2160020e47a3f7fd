//! Worker process command: `review-pulse worker`.

use anyhow::Result;
use std::path::PathBuf;

use super::super::Cli;

pub async fn cmd_worker(
    cli: &Cli,
    project_dir: PathBuf,
    port: Option<u16>,
    bind: Option<String>,
) -> Result<()> {
    use review_pulse::config::PulseConfig;

    let mut config = PulseConfig::with_cli_args(project_dir, cli.verbose, cli.worker_url.clone())?;
    if let Some(port) = port {
        config.toml.worker.port = port;
    }
    if let Some(bind) = bind {
        config.toml.worker.bind = bind;
    }

    let _guard = review_pulse::logging::init_worker(
        config.verbose,
        config.toml.worker.log_format,
        &config.log_dir(),
    )?;
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }

    review_pulse::server::start_worker(&config).await
}
