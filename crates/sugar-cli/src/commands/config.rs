//! Config command handlers

use anyhow::{bail, Context, Result};
use sugar_core::{CloudDescriptor, StackConfig};

use crate::output::{Output, OutputFormat};

fn or_unset(value: Option<String>) -> String {
    value.unwrap_or_else(|| "(not set)".to_string())
}

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = StackConfig::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(serde_json::json!({
            "database_path": config.database_path,
            "database_name": config.database_name,
            "automigrating": config.automigrating,
            "app_name": config.app_name,
            "cloud": config.cloud.as_ref().map(|c| &c.identity_token),
        })),
        OutputFormat::Quiet => {
            if let Some(ref path) = config.database_path {
                println!("{}", path.display());
            } else if let Some(ref name) = config.database_name {
                println!("{}", name);
            }
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!(
                "  database_path: {}",
                or_unset(config.database_path.map(|p| p.display().to_string()))
            );
            println!("  database_name: {}", or_unset(config.database_name));
            println!("  automigrating: {}", config.automigrating);
            println!("  app_name:      {}", or_unset(config.app_name));
            println!(
                "  cloud:         {}",
                or_unset(config.cloud.map(|c| c.identity_token))
            );
            println!();
            println!("Config file: {}", StackConfig::config_file_path().display());
        }
    }

    Ok(())
}

/// Empty or "none" clears an optional value
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = StackConfig::load().context("Failed to load configuration")?;
    apply(&mut config, &key, &value)?;
    config.save().context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}

fn apply(config: &mut StackConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "database_path" => config.database_path = optional(value).map(Into::into),
        "database_name" => config.database_name = optional(value),
        "automigrating" => {
            config.automigrating = value
                .parse()
                .context("Invalid value for automigrating. Use 'true' or 'false'.")?;
        }
        "app_name" => config.app_name = optional(value),
        "cloud" => config.cloud = optional(value).map(CloudDescriptor::new),
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: database_path, database_name, automigrating, app_name, cloud",
                key
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_apply_known_keys() {
        let mut config = StackConfig::default();

        apply(&mut config, "database_path", "/tmp/a.sqlite").unwrap();
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/a.sqlite")));
        apply(&mut config, "database_path", "none").unwrap();
        assert_eq!(config.database_path, None);

        apply(&mut config, "automigrating", "false").unwrap();
        assert!(!config.automigrating);

        apply(&mut config, "cloud", "iCloud.com.example").unwrap();
        assert_eq!(
            config.cloud.as_ref().map(|c| c.identity_token.as_str()),
            Some("iCloud.com.example")
        );
        assert_eq!(
            config.cloud.as_ref().map(|c| c.data_directory_name.as_str()),
            Some("Data")
        );
    }

    #[test]
    fn test_apply_rejects_bad_input() {
        let mut config = StackConfig::default();
        assert!(apply(&mut config, "automigrating", "maybe").is_err());
        assert!(apply(&mut config, "sync_url", "ws://x").is_err());
    }
}
