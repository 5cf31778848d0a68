//! `esquire config`: Configuration management commands.

use esquire_config::AppConfig;
use std::path::Path;

pub async fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load_with_env(path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();
            let floor = config.memory.vacuum_interval_hours_effective();
            if config.memory.vacuum_interval_hours < floor {
                warnings.push("memory.vacuum_interval_hours is below the 1-hour floor and will be raised");
            }
            if config.memory.context_limit > config.memory.max_rows {
                warnings.push("memory.context_limit exceeds memory.max_rows; older turns are never available");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            let memory = if config.memory.enabled { "enabled" } else { "disabled" };
            println!("   Memory:      {memory}");
            println!("   Store:       {}", config.memory.path.display());
            println!("   Collection:  {}", config.retrieval.collection);
            println!("   Model:       {}", config.agent.model);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load_with_env(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", path.display());
    Ok(())
}
