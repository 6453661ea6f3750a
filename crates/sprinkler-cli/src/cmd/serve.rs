use anyhow::{Context, Result};
use sprinkler_core::config::{Config, HardwareConfig};
use sprinkler_core::SprinklerSystem;
use std::path::Path;
use std::sync::Arc;

pub fn run(config_path: &Path, port: Option<u16>, mock_hardware: bool) -> Result<()> {
    let mut config = Config::load(config_path).context("failed to load config")?;
    if mock_hardware {
        config.hardware = HardwareConfig::Mock;
    }

    let warnings = config.validate();
    for w in &warnings {
        tracing::warn!(level = ?w.level, "{}", w.message);
    }
    if Config::has_errors(&warnings) {
        anyhow::bail!("config validation found errors; run `sprinklerd config validate`");
    }

    let port = port.unwrap_or(config.port);
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        let system = Arc::new(
            SprinklerSystem::from_config(&config)
                .await
                .context("failed to boot controller")?,
        );

        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        println!(
            "sprinklerd: {} actuators, {} scenarios → http://localhost:{}",
            config.actuators.len(),
            config.scenarios.len(),
            listener.local_addr()?.port()
        );

        let result = sprinkler_server::serve_on(system.clone(), listener, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received, shutting down");
        })
        .await;

        system.shutdown().await;
        result
    })
}
