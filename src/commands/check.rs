//! Check command implementation.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, StorageConfig};
use crate::dns::SystemResolver;
use crate::pattern::PatternEngine;

/// Validate the configuration and compile every pattern, then print a summary.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let engine = PatternEngine::from_config(&config, Arc::new(SystemResolver))?;

    println!();
    println!("Configuration OK: {}", config_path.display());
    println!();

    let mut rules: Vec<_> = engine.rules().collect();
    rules.sort_by(|a, b| a.name.cmp(&b.name));
    for rule in rules {
        let instant = rule.patterns.iter().filter(|p| p.instant_ban).count();
        println!(
            "  {:<12} {} pattern(s) ({} instant), {} failures in {}s, {} ignored",
            rule.name,
            rule.patterns.len(),
            instant,
            rule.threshold,
            rule.window_seconds,
            rule.ignored.len()
        );
        for path in &rule.log_files {
            let state = if path.exists() { "ok" } else { "missing" };
            println!("      {} [{}]", path.display(), state);
        }
    }

    println!();
    match config.storage {
        StorageConfig::Embedded(ref embedded) => {
            println!("Storage: embedded ({})", embedded.path.display());
        }
        StorageConfig::Networked(ref networked) => {
            let sync = if networked.sync.enabled {
                format!(
                    "sync every {}s as '{}'",
                    networked.sync.interval_seconds, networked.sync.node_name
                )
            } else {
                "sync disabled".to_string()
            };
            println!("Storage: networked ({})", sync);
        }
    }
    println!("Deny action: {}", config.deny_action.as_str());
    println!();

    Ok(())
}
