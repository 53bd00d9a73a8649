//! `switchboard status`: Show effective configuration.

use std::path::Path;

use switchboard_config::AppConfig;

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let file = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(AppConfig::config_path);

    println!("Switchboard Status");
    println!("==================");
    println!("  Config file:   {}", file.display());
    println!("  Provider:      {}", config.inference.provider);
    println!("  Model:         {}", config.inference.model);
    println!(
        "  API key:       {}",
        if config.inference.has_api_key() { "set" } else { "missing" }
    );
    println!("  Session TTL:   {} min", config.session.ttl_minutes);
    println!("  Sweep every:   {} s", config.session.sweep_interval_secs);
    println!("  Window:        {} turns", config.conversation.window_max_turns);
    println!("  Gateway:       {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "  Retry policy:  {} attempts, {} s apart",
        config.tool_servers.max_attempts, config.tool_servers.retry_delay_secs
    );
    println!("  Tool servers:");
    if config.tool_servers.endpoints.is_empty() {
        println!("    (none)");
    }
    for endpoint in &config.tool_servers.endpoints {
        println!("    {:<16} {}", endpoint.id, endpoint.url);
    }

    if !file.exists() {
        println!("\n  No config file, using defaults. Run `switchboard init` to create one.");
    }

    Ok(())
}
