//! Query the health of a running resource manager

use anyhow::Result;
use colored::Colorize;
use reqwest::StatusCode;
use resmgr_lib::health::{HealthResponse, ReadinessResponse};
use serde::Serialize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, format_timestamp, print_json, print_table, print_warning, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

#[derive(Serialize)]
struct HealthReport {
    health: HealthResponse,
    readiness: ReadinessResponse,
}

fn status_name(health: &HealthResponse) -> String {
    serde_json::to_value(health.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Show daemon health; returns whether it is healthy and ready
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<bool> {
    let unavailable = [StatusCode::SERVICE_UNAVAILABLE];
    let health: HealthResponse = client.get("healthz", &unavailable).await?;
    let readiness: ReadinessResponse = client.get("readyz", &unavailable).await?;
    let ok = health.status.is_operational() && readiness.ready;

    match format {
        OutputFormat::Json => print_json(&HealthReport { health, readiness })?,
        OutputFormat::Table => {
            let ready = if readiness.ready { "ready" } else { "not ready" };
            println!(
                "{} {}, {}",
                "Resource manager".bold(),
                color_status(&status_name(&health)),
                color_status(ready)
            );
            if let Some(reason) = &readiness.reason {
                print_warning(reason);
            }

            let rows: Vec<ComponentRow> = health
                .components
                .iter()
                .map(|(name, component)| ComponentRow {
                    name: name.clone(),
                    status: serde_json::to_value(component.status)
                        .ok()
                        .and_then(|v| v.as_str().map(color_status))
                        .unwrap_or_default(),
                    message: component.message.clone().unwrap_or_default(),
                    last_check: format_timestamp(component.last_check_timestamp),
                })
                .collect();
            print_table(&rows, "No components registered");
        }
    }

    Ok(ok)
}
