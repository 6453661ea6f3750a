use crate::output::{print_json, print_table, timestamp};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sprinkler_core::config::Config;
use sprinkler_core::event_log::RunStore;
use std::path::Path;

pub fn run(
    config_path: &Path,
    actuator: u64,
    from: Option<&str>,
    to: Option<&str>,
    json: bool,
) -> Result<()> {
    let config = Config::load(config_path).context("failed to load config")?;
    if !config.actuators.iter().any(|a| a.id == Some(actuator)) {
        anyhow::bail!("actuator {actuator} is not configured");
    }
    let from = from.map(parse_instant).transpose()?;
    let to = to.map(parse_instant).transpose()?;

    let store = RunStore::open(&config.event_log_path).with_context(|| {
        format!(
            "failed to open event log at {}",
            config.event_log_path.display()
        )
    })?;
    let runs = store.query(actuator, from, to)?;

    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs recorded for actuator {actuator}.");
        return Ok(());
    }

    let total: f64 = runs.iter().map(|r| r.volume_liters).sum();
    let rows = runs
        .iter()
        .map(|r| {
            vec![
                timestamp(r.started_at),
                format!("{:.1}s", r.duration_seconds()),
                format!("{:.2}", r.volume_liters),
            ]
        })
        .collect();
    print_table(&["STARTED", "DURATION", "LITERS"], rows);
    println!();
    println!("{} runs, {total:.2} liters", runs.len());
    Ok(())
}

/// Accept RFC 3339 or integer milliseconds since the epoch, matching the
/// `from`/`to` query parameters of the HTTP API.
fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ms) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| anyhow!("timestamp {ms} is out of range"));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("'{raw}' is neither RFC 3339 nor epoch milliseconds"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_epoch_millis() {
        let dt = parse_instant("1700000000000").unwrap();
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn parses_rfc3339() {
        let dt = parse_instant("2024-05-01T06:30:00+02:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-05-01T04:30:00+00:00");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_instant("yesterday").is_err());
    }
}
