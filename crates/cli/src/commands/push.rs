//! Push configuration and adjustments to a running resource manager

use anyhow::{Context, Result};
use colored::Colorize;
use resmgr_lib::config::{load_config_file, SetAdjustmentReply, SetConfigReply, SetConfigRequest};
use resmgr_lib::Adjustment;
use std::path::Path;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{print_error, print_json, print_success, print_table, OutputFormat};

#[derive(Tabled)]
struct AdjustmentErrorRow {
    #[tabled(rename = "Adjustment")]
    name: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Build the configuration request for a YAML or JSON file
pub fn config_request(path: &Path, node_name: &str) -> Result<SetConfigRequest> {
    let config = load_config_file(path, node_name)?;
    Ok(SetConfigRequest {
        node_name: config.node_name,
        config: config.data,
    })
}

/// Read a set of adjustments from a YAML or JSON file
pub fn read_adjustment(path: &Path) -> Result<Adjustment> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let adjustment: Adjustment = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse adjustments in {}", path.display()))?;
    Ok(adjustment)
}

/// Push a configuration file; returns whether it was accepted
pub async fn push_config(
    client: &ApiClient,
    path: &Path,
    node_name: &str,
    format: OutputFormat,
) -> Result<bool> {
    let request = config_request(path, node_name)?;
    let reply: SetConfigReply = client.post("v1/config", &request).await?;

    match format {
        OutputFormat::Json => print_json(&reply)?,
        OutputFormat::Table if reply.error.is_empty() => print_success(&format!(
            "Configuration with {} entries applied",
            request.config.len()
        )),
        OutputFormat::Table => print_error(&reply.error),
    }

    Ok(reply.error.is_empty())
}

/// Push an adjustment file; returns whether every adjustment was accepted
pub async fn push_adjustment(client: &ApiClient, path: &Path, format: OutputFormat) -> Result<bool> {
    let adjustment = read_adjustment(path)?;
    let reply: SetAdjustmentReply = client.post("v1/adjustment", &adjustment).await?;

    match format {
        OutputFormat::Json => print_json(&reply)?,
        OutputFormat::Table if reply.errors.is_empty() => print_success(&format!(
            "{} adjustments applied",
            adjustment.specs.len()
        )),
        OutputFormat::Table => {
            println!("{}", "Rejected adjustments".bold());
            let rows: Vec<AdjustmentErrorRow> = reply
                .errors
                .iter()
                .map(|(name, error)| AdjustmentErrorRow {
                    name: name.clone(),
                    error: error.clone(),
                })
                .collect();
            print_table(&rows, "No errors");
        }
    }

    Ok(reply.errors.is_empty())
}
