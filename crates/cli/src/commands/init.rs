//! `switchboard init`: Write a starter config file.

use std::path::Path;

use switchboard_config::AppConfig;

pub async fn run(config_path: Option<&Path>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(AppConfig::config_path);

    if path.exists() && !force {
        println!("Config already exists at: {}", path.display());
        println!("   Edit it manually or re-run with --force.");
        return Ok(());
    }

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    std::fs::write(&path, AppConfig::default_toml())?;

    println!("Created config at: {}", path.display());
    println!("\nNext steps:");
    println!("   1. Add your tool servers under [tool_servers]");
    println!("   2. Set an API key (or SWITCHBOARD_API_KEY)");
    println!("   3. Run: switchboard chat");

    Ok(())
}
