//! Disk setup

use anyhow::{Context, Result};
use queuework_core::Config;
use queuework_storage::{create_disks, DiskRegistry};

pub async fn setup_disks(config: &Config) -> Result<DiskRegistry> {
    tracing::info!("Initializing disks...");
    let disks = create_disks(config)
        .await
        .context("Failed to initialize storage disks")?;

    tracing::info!(
        default_disk = %config.default_disk(),
        archive_disk = %config.archive_disk(),
        local_disk = disks.local().is_some(),
        "Disks initialized successfully"
    );
    Ok(disks)
}
