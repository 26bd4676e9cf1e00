use std::env::consts::{ARCH, FAMILY, OS};

use anyhow::{bail, Context, Result};
use tracing::{info, trace};

use crate::harvest::{init_config, init_logger, Orchestrator};

mod harvest;

const CONFIG_DIR_ENV: &str = "HARVESTER_CONFIG_DIR";
const DEFAULT_CONFIG_DIR: &str = "./config";

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir =
        std::env::var(CONFIG_DIR_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());
    let config_manager = init_config(&config_dir)
        .with_context(|| format!("Failed to load configuration from {}", config_dir))?;

    // Held until exit so the file writer flushes.
    let _log_guard = init_logger(config_manager.app_config())?;
    log_system_information();
    for notice in config_manager.notices() {
        notice.log();
    }

    if !config_manager.has_valid_credentials() {
        bail!(
            "No credentials configured; fill in the primary account in {}",
            config_manager.config_dir().join("accounts.toml").display()
        );
    }

    let orchestrator = Orchestrator::new(
        config_manager.app_config().clone(),
        config_manager.accounts_config().clone(),
    );
    let summary = orchestrator.run().await?;

    info!(
        downloaded = summary.stats.downloaded,
        skipped = summary.stats.skipped,
        failed = summary.failures,
        accounts = summary.accounts_tracked,
        "Story harvester exiting"
    );
    Ok(())
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
    info!("story_harvester v{} starting", env!("CARGO_PKG_VERSION"));
}
