//! Run control commands: `start`, `progress`, `pause`, `resume`, `cancel`, `list`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use review_pulse::client::WorkerClient;
use review_pulse::config::PulseConfig;
use review_pulse::errors::ClientError;
use review_pulse::models::{Progress, RunStatus, RunSummary};
use review_pulse::orchestrator::{ControlSignal, SignalAck};
use review_pulse::worker::StartRun;

use super::super::Cli;

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

fn connect(cli: &Cli, project_dir: PathBuf) -> Result<WorkerClient> {
    let config = PulseConfig::with_cli_args(project_dir, cli.verbose, cli.worker_url.clone())?;
    review_pulse::logging::init_cli(config.verbose);
    let url = config.worker_url();
    tracing::debug!(%url, "using worker");
    Ok(WorkerClient::new(&url)?)
}

/// Attach a hint to errors a user can act on.
fn explain(err: ClientError) -> anyhow::Error {
    match err {
        ClientError::Unreachable { .. } => anyhow::Error::new(err)
            .context("Is the worker running? Start it with 'review-pulse worker'."),
        other => anyhow::Error::new(other),
    }
}

fn styled_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let text = console::style(status.as_str());
    match status {
        RunStatus::Running => text.cyan(),
        RunStatus::Paused => text.yellow(),
        RunStatus::Completed => text.green(),
        RunStatus::Failed => text.red().bold(),
        RunStatus::Cancelled => text.dim(),
    }
}

fn format_average(average: Option<f64>) -> String {
    average
        .map(|a| format!("{:.2}", a))
        .unwrap_or_else(|| "-".to_string())
}

/// Age of a `YYYY-MM-DD HH:MM:SS` UTC timestamp, e.g. "5m ago".
fn format_age(timestamp: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    let Ok(at) = chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S") else {
        return timestamp.to_string();
    };
    let secs = (now - at.and_utc()).num_seconds().max(0);
    match secs {
        0..60 => format!("{}s ago", secs),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

fn print_progress(progress: &Progress) {
    println!();
    println!(
        "Run {} ({})",
        console::style(&progress.run_id).bold(),
        progress.source_id
    );
    if let Some(name) = &progress.product_name {
        match progress.sale_price {
            Some(price) => println!("Product: {} @ {:.2}", name, price),
            None => println!("Product: {}", name),
        }
    }
    if let Some(url) = &progress.product_url {
        println!("URL:     {}", url);
    }
    println!("Status:  {}", styled_status(progress.status));
    println!(
        "Records: {} / {} (skipped {})",
        progress.records_processed, progress.max_records, progress.records_skipped
    );
    match progress.total_known {
        Some(total) => println!("Pages:   {} (source reports {} reviews)", progress.pages_processed, total),
        None => println!("Pages:   {}", progress.pages_processed),
    }
    println!("Average: {}", format_average(progress.average));
    if let Some(failure) = &progress.failure {
        println!(
            "  {} {} step on page {} after {} attempt(s): [{}] {}",
            console::style("Error:").red().bold(),
            failure.step,
            failure.page_index,
            failure.attempts,
            failure.error_class,
            failure.message
        );
    }
    println!();
}

fn print_progress_line(progress: &Progress) {
    println!(
        "  page {:<4} records {:<6} avg {:<6} {}",
        progress.pages_processed,
        progress.records_processed,
        format_average(progress.average),
        styled_status(progress.status)
    );
}

async fn watch_until_terminal(client: &WorkerClient, run_id: &str) -> Result<Progress> {
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    let mut last: Option<(u64, RunStatus)> = None;
    loop {
        ticker.tick().await;
        let progress = client.progress(run_id).await.map_err(explain)?;
        let key = (progress.pages_processed, progress.status);
        if last != Some(key) {
            print_progress_line(&progress);
            last = Some(key);
        }
        if progress.status.is_terminal() {
            return Ok(progress);
        }
    }
}

pub async fn cmd_start(cli: &Cli, project_dir: PathBuf, request: StartRun, wait: bool) -> Result<()> {
    let client = connect(cli, project_dir)?;
    let started = client.start_run(&request).await.map_err(explain)?;

    println!(
        "Started run {} for {} (limit {} records)",
        console::style(&started.run_id).bold(),
        started.source_id,
        started.max_records
    );

    if wait {
        let done = watch_until_terminal(&client, &started.run_id).await?;
        print_progress(&done);
    } else {
        println!("Follow it with 'review-pulse progress {} --watch'.", started.run_id);
    }
    Ok(())
}

pub async fn cmd_progress(
    cli: &Cli,
    project_dir: PathBuf,
    run_id: &str,
    watch: bool,
    json: bool,
) -> Result<()> {
    let client = connect(cli, project_dir)?;
    let progress = if watch && !json {
        watch_until_terminal(&client, run_id).await?
    } else {
        client.progress(run_id).await.map_err(explain)?
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&progress).context("Failed to encode progress")?
        );
    } else {
        print_progress(&progress);
    }
    Ok(())
}

pub async fn cmd_signal(
    cli: &Cli,
    project_dir: PathBuf,
    run_id: &str,
    signal: ControlSignal,
) -> Result<()> {
    let client = connect(cli, project_dir)?;
    let reply = match client.signal(run_id, signal).await {
        Ok(reply) => reply,
        Err(ClientError::Conflict(message)) => {
            println!("{} {}", console::style("⚠").yellow(), message);
            return Ok(());
        }
        Err(e) => return Err(explain(e)),
    };

    match reply.result {
        SignalAck::Accepted => println!(
            "{} sent to {} (currently {}); it applies at the next page boundary.",
            signal.as_str(),
            reply.run_id,
            styled_status(reply.status)
        ),
        SignalAck::NoOp => println!(
            "Nothing to do: run {} is {}.",
            reply.run_id,
            styled_status(reply.status)
        ),
    }
    Ok(())
}

fn print_runs(runs: &[RunSummary], now: chrono::DateTime<chrono::Utc>) {
    println!(
        "{:<38} {:<16} {:<10} {:>8} {:>7}  Updated",
        "Run", "Source", "Status", "Records", "Avg"
    );
    println!(
        "{:<38} {:<16} {:<10} {:>8} {:>7}  -------",
        "-".repeat(36),
        "-".repeat(14),
        "------",
        "-------",
        "---"
    );
    for run in runs {
        println!(
            "{:<38} {:<16} {:<10} {:>8} {:>7}  {}",
            run.run_id,
            run.source_id,
            styled_status(run.status),
            run.records_processed,
            format_average(run.average),
            format_age(&run.updated_at, now)
        );
    }
}

pub async fn cmd_list(cli: &Cli, project_dir: PathBuf, limit: usize) -> Result<()> {
    let client = connect(cli, project_dir)?;
    let runs = client.list(limit).await.map_err(explain)?;

    println!();
    if runs.is_empty() {
        println!("No runs yet. Start one with 'review-pulse start <source-id>'.");
    } else {
        print_runs(&runs, chrono::Utc::now());
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_age() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(format_age("2024-05-01 11:59:30", now), "30s ago");
        assert_eq!(format_age("2024-05-01 11:15:00", now), "45m ago");
        assert_eq!(format_age("2024-05-01 09:00:00", now), "3h ago");
        assert_eq!(format_age("2024-04-28 12:00:00", now), "3d ago");
        assert_eq!(format_age("not a time", now), "not a time");
    }

    #[test]
    fn test_format_average() {
        assert_eq!(format_average(Some(3.14159)), "3.14");
        assert_eq!(format_average(None), "-");
    }
}
