//! Command handlers

pub mod config;
pub mod init;
pub mod object;
pub mod remove;
pub mod status;

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context as _, Result};
use serde_json::Value;
use sugar_core::{
    CommitOutcome, Context, Initialization, MigrationOutcome, Properties, Stack, StackConfig,
    StackStatus,
};
use tracing::debug;

/// Configuration from file and environment, with the `--database` override
pub fn load_config(database: Option<PathBuf>) -> Result<StackConfig> {
    let mut config = StackConfig::load().context("Failed to load configuration")?;
    if let Some(path) = database {
        config.database_path = Some(path);
    }
    Ok(config)
}

/// Build a stack on this thread and wait until its store is open
pub async fn open_stack(config: StackConfig) -> Result<(Stack, MigrationOutcome)> {
    let stack = Stack::new(config, None);
    let outcome = initialize(&stack).await?;
    debug!(stack = stack.name(), ?outcome, "Store opened");
    Ok((stack, outcome))
}

/// Initialize `stack`, waiting for a cloud-backed open to settle
pub async fn initialize(stack: &Stack) -> Result<MigrationOutcome> {
    match stack.initialize()? {
        Initialization::Completed(outcome) => Ok(outcome),
        Initialization::Pending => {
            let mut status = stack.subscribe_status();
            let settled = status.wait_for(StackStatus::is_settled).await?.clone();
            match settled {
                StackStatus::Ready(outcome) => Ok(outcome),
                StackStatus::Failed { message, .. } => bail!("Failed to open store: {}", message),
                other => bail!("Stack settled in unexpected state {:?}", other),
            }
        }
    }
}

/// Commit a worker, write the root to disk and deliver merges to main
pub fn save(stack: &Stack, worker: &Context) -> Result<CommitOutcome> {
    worker.commit()?;
    let outcome = stack.commit_root()?;
    stack.main_queue().run_pending()?;
    Ok(outcome)
}

/// Parse `key=value` pairs; values that are not valid JSON become strings
pub fn parse_properties(assignments: &[String]) -> Result<Properties> {
    let mut properties = Properties::new();
    for assignment in assignments {
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{}'", assignment))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Empty property name in '{}'", assignment);
        }
        let value =
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        properties.insert(key.to_string(), value);
    }
    Ok(properties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_properties() {
        let props = parse_properties(&[
            "name=Ada".to_string(),
            "age=36".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
            "note=x=y".to_string(),
        ])
        .unwrap();

        assert_eq!(props["name"], json!("Ada"));
        assert_eq!(props["age"], json!(36));
        assert_eq!(props["tags"], json!(["a", "b"]));
        assert_eq!(props["note"], json!("x=y"));
    }

    #[test]
    fn test_parse_properties_rejects_malformed() {
        assert!(parse_properties(&["name".to_string()]).is_err());
        assert!(parse_properties(&["=value".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_open_and_save_round_trip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StackConfig::at_path(temp_dir.path().join("cli.sqlite"));

        let (stack, outcome) = open_stack(config.clone()).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Opened);

        let worker = stack.worker_context().unwrap();
        worker
            .insert_with("Person", parse_properties(&["name=Ada".to_string()]).unwrap())
            .unwrap();
        assert!(matches!(
            save(&stack, &worker).unwrap(),
            CommitOutcome::Persisted { .. }
        ));
        drop(worker);
        drop(stack);

        let (reopened, _) = open_stack(config).await.unwrap();
        assert_eq!(reopened.main_context().unwrap().count("Person").unwrap(), 1);
    }
}
