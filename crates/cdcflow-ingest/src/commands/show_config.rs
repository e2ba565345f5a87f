//! `show-config` command

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::config::PipelineConfig;

/// Log the configuration a `run` would start from
pub fn run(config_path: Option<&Path>) -> Result<PipelineConfig> {
    let config = PipelineConfig::load(config_path)?;
    info!(
        config = %serde_json::to_string_pretty(&config)?,
        fetch_timeout_ms = config.importer.fetch_timeout_duration().as_millis() as u64,
        "Effective configuration"
    );
    Ok(config)
}
