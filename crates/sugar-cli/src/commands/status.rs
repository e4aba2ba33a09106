//! Status command handler

use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Local};
use sugar_core::{Stack, StackConfig};

use crate::output::{Output, OutputFormat};

use super::initialize;

struct FileInfo {
    size: u64,
    modified: Option<DateTime<Local>>,
}

fn file_info(path: &Path) -> Option<FileInfo> {
    let metadata = fs::metadata(path).ok()?;
    Some(FileInfo {
        size: metadata.len(),
        modified: metadata.modified().ok().map(DateTime::<Local>::from),
    })
}

/// Show the stack and its store
///
/// The store is opened only when it already exists.
pub async fn show(config: StackConfig, output: &Output) -> Result<()> {
    let stack = Stack::new(config, None);
    let exists = stack.store_path().is_some_and(|path| path.exists());
    let outcome = if exists {
        Some(initialize(&stack).await?)
    } else {
        None
    };
    let path = stack.store_path();
    let info = path.as_deref().and_then(file_info);

    match output.format {
        OutputFormat::Json => output.json(serde_json::json!({
            "stack": stack.name(),
            "description": stack.description(),
            "store_path": path,
            "exists": info.is_some(),
            "size": info.as_ref().map(|i| i.size),
            "modified": info.as_ref().and_then(|i| i.modified).map(|m| m.to_rfc3339()),
            "outcome": outcome,
            "state": stack.initializer_state(),
            "automigrating": stack.config().automigrating,
        })),
        OutputFormat::Quiet => {
            if let Some(ref path) = path {
                println!("{}", path.display());
            }
        }
        OutputFormat::Human => {
            println!("Sugar Status");
            println!("============");
            println!();
            println!("Stack: {}", stack.name());
            println!("  {}", stack.description());
            println!();
            println!("Store:");
            match path {
                Some(ref path) => println!("  Path:     {}", path.display()),
                None => println!("  Path:     (not configured)"),
            }
            match info {
                Some(ref info) => {
                    println!("  Size:     {} bytes", info.size);
                    if let Some(modified) = info.modified {
                        println!("  Modified: {}", modified.format("%Y-%m-%d %H:%M"));
                    }
                }
                None => println!("  Not created yet; run `sugar init`"),
            }
            println!("  State:    {:?}", stack.initializer_state());
            if let Some(outcome) = outcome {
                println!("  Opened:   {:?}", outcome);
            }
            println!("  Automigrating: {}", stack.config().automigrating);
        }
    }

    Ok(())
}
