//! `switchboard servers`: Connect to every configured tool server and
//! print what each one offers.

use std::path::Path;
use std::sync::Arc;

use switchboard_servers::{HttpConnector, ToolServerRegistry};

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let endpoints = switchboard_orchestrator::runtime::endpoints(&config.tool_servers);
    if endpoints.is_empty() {
        println!("No tool servers configured.");
        return Ok(());
    }

    let connector = Arc::new(HttpConnector::new(config.tool_servers.connect_timeout())?);
    let registry = ToolServerRegistry::new(connector);
    let policy = switchboard_orchestrator::runtime::retry_policy(&config.tool_servers);

    println!("Connecting to {} tool server(s)...", endpoints.len());
    if let Err(e) = registry.connect_all(&endpoints, policy).await {
        println!("  {e}");
    }

    println!();
    for status in registry.statuses().await {
        println!(
            "  {:<16} {:<12} {} tool(s)  {}",
            status.server_id, status.state, status.tool_count, status.url
        );
        if let Some(err) = &status.last_error {
            println!("    last error: {err}");
        }
    }

    let tools = registry.aggregated_tools().await;
    if !tools.is_empty() {
        println!("\nTools:");
        for tool in &tools {
            println!("  {:<32} {}", tool.qualified_name(), tool.description);
        }
    }

    registry.shutdown().await;
    Ok(())
}
