//! Init command handler

use anyhow::Result;
use sugar_core::{MigrationOutcome, StackConfig};

use crate::output::{Output, OutputFormat};

use super::open_stack;

/// Open the store, creating or recreating it as needed
pub async fn run(config: StackConfig, output: &Output) -> Result<()> {
    let (stack, outcome) = open_stack(config).await?;
    let path = stack.store_path();

    match output.format {
        OutputFormat::Json => output.json(serde_json::json!({
            "stack": stack.name(),
            "store_path": path,
            "outcome": outcome,
            "state": stack.initializer_state(),
        })),
        OutputFormat::Quiet => {
            if let Some(path) = path {
                println!("{}", path.display());
            }
        }
        OutputFormat::Human => {
            let location = path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(unknown)".to_string());
            match outcome {
                MigrationOutcome::Opened => output.success(&format!("Store ready at {}", location)),
                MigrationOutcome::RecreatedAfterIncompatibility => {
                    println!("Store at {} was incompatible and has been recreated empty.", location);
                    println!("Any data it held is gone.");
                }
                MigrationOutcome::FatalOpenError => {
                    println!("Store at {} could not be opened.", location)
                }
            }
        }
    }

    Ok(())
}
