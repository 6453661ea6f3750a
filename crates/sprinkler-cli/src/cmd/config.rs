use crate::output::{print_fields, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use sprinkler_core::config::{Config, WarnLevel};
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for common mistakes
    Validate,

    /// Show the configured actuators and scenarios
    Show,
}

pub fn run(path: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(path, json),
        ConfigSubcommand::Show => show(path, json),
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(path).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if Config::has_errors(&warnings) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(path).context("failed to load config")?;

    if json {
        return print_json(&config);
    }

    let environment = serde_json::to_value(config.environment)?;
    print_fields(&[
        ("environment", environment.as_str().unwrap_or_default().to_string()),
        ("port", config.port.to_string()),
        ("event log", config.event_log_path.display().to_string()),
    ]);
    println!();

    let rows = config
        .actuators
        .iter()
        .map(|a| {
            vec![
                a.id.map_or_else(|| "(random)".to_string(), |id| id.to_string()),
                a.name.clone(),
                a.line.to_string(),
                format!("{}", a.rate_liters_per_second),
                match a.auto_shut_off_seconds {
                    0 => "-".to_string(),
                    s => format!("{s}s"),
                },
                if a.is_active_by_default { "on" } else { "off" }.to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "LINE", "L/S", "SHUTOFF", "BOOT"], rows);

    if config.scenarios.is_empty() {
        return Ok(());
    }
    println!();
    let rows = config
        .scenarios
        .iter()
        .map(|s| {
            let steps: Vec<String> = s
                .timeline
                .iter()
                .map(|step| format!("{}:{}s", step.actuator_id, step.duration_seconds))
                .collect();
            vec![
                s.id.to_string(),
                s.name.clone(),
                steps.join(" "),
                s.run_daily.map_or_else(
                    || "-".to_string(),
                    |d| format!("{:02}:{:02}:{:02}", d.hour, d.minute, d.second),
                ),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "TIMELINE", "DAILY"], rows);
    Ok(())
}
