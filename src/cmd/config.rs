//! Configuration view and validation commands: `review-pulse config`.

use anyhow::Result;

use super::super::ConfigCommands;

fn show_value(name: &str, value: Option<&str>) {
    match value {
        Some(v) => println!("  {} = \"{}\"", name, v),
        None => println!("  {} = {}", name, console::style("(unset)").dim()),
    }
}

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use review_pulse::config::{CONFIG_DIR, CONFIG_FILE, PulseConfig, PulseToml};

    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("review-pulse Configuration");
            println!("==========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No pulse.toml found at {}", config_path.display());
                println!("Run 'review-pulse config init' to create one.");
            }
            println!();

            // Effective values include the global file and PULSE_* overrides.
            let config = PulseConfig::new(project_dir.to_path_buf())?;
            let toml = &config.toml;

            println!("[worker]");
            println!("  bind = \"{}\"", toml.worker.bind);
            println!("  port = {}", toml.worker.port);
            println!("  data_dir = \"{}\"", config.data_dir().display());
            println!("  log_format = \"{}\"", toml.worker.log_format);
            println!("  url = \"{}\"", config.worker_url());
            println!();

            println!("[source]");
            show_value("api_base", toml.source.api_base.as_deref());
            show_value("consumer_id", toml.source.consumer_id.as_deref());
            show_value("key_version", toml.source.key_version.as_deref());
            println!("  timeout_secs = {}", toml.source.timeout_secs);
            show_value("product_url_base", toml.source.product_url_base.as_deref());
            println!();

            println!("[scoring]");
            show_value("endpoint", toml.scoring.endpoint.as_deref());
            show_value(
                "api_key",
                toml.scoring.api_key.as_ref().map(|_| "********"),
            );
            println!("  timeout_secs = {}", toml.scoring.timeout_secs);
            println!("  batch_size = {}", toml.scoring.batch_size);
            println!("  max_text_bytes = {}", toml.scoring.max_text_bytes);
            println!();

            println!("[runs]");
            println!("  max_records = {}", toml.runs.max_records);
            println!("  page_size = {}", toml.runs.page_size);
            println!("  weight_policy = \"{}\"", toml.runs.weight_policy);
            println!("  language_code = \"{}\"", toml.runs.language_code);
            println!();

            for (name, policy) in [("fetch", toml.fetch_policy()), ("score", toml.score_policy())] {
                println!("[retry.{}]", name);
                println!(
                    "  initial_interval_ms = {}",
                    policy.initial_interval.as_millis()
                );
                println!("  backoff_coefficient = {}", policy.backoff_coefficient);
                println!(
                    "  maximum_interval_ms = {}",
                    policy.maximum_interval.as_millis()
                );
                match policy.maximum_attempts {
                    Some(n) => println!("  maximum_attempts = {}", n),
                    None => println!("  maximum_attempts = unlimited"),
                }
                match policy.attempt_timeout {
                    Some(t) => println!("  attempt_timeout_ms = {}", t.as_millis()),
                    None => println!("  attempt_timeout_ms = none"),
                }
                let mut classes: Vec<_> = policy.non_retryable.iter().cloned().collect();
                classes.sort();
                println!("  non_retryable = {:?}", classes);
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = PulseConfig::new(project_dir.to_path_buf())?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("pulse.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir)?;
            }

            let toml = PulseToml::default();
            toml.save(&config_path)?;

            println!("Created pulse.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [source] api_base, consumer_id, key_version");
            println!("  - [scoring] endpoint, api_key, batch_size");
            println!("  - [runs] max_records, page_size, weight_policy");
            println!("  - [retry.fetch] / [retry.score] for backoff and attempt limits");
            println!();
        }
    }

    Ok(())
}
