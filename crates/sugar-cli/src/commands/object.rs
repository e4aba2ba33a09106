//! Object command handlers

use anyhow::{anyhow, Result};
use sugar_core::{ObjectId, StackConfig};

use crate::output::{Output, OutputFormat};

use super::{open_stack, parse_properties, save};

/// Insert an object and write it to disk
pub async fn insert(
    config: StackConfig,
    entity: String,
    assignments: Vec<String>,
    output: &Output,
) -> Result<()> {
    let properties = parse_properties(&assignments)?;
    let (stack, _) = open_stack(config).await?;

    let worker = stack.worker_context()?;
    let temporary = worker.insert_with(&entity, properties)?;
    save(&stack, &worker)?;
    let id = worker.resolve_id(temporary)?;

    match stack.main_context()?.object(id)? {
        Some(object) => output.print_object(&object),
        None => return Err(anyhow!("Inserted object {} is not visible after saving", id)),
    }
    Ok(())
}

pub async fn count(config: StackConfig, entity: String, output: &Output) -> Result<()> {
    let (stack, _) = open_stack(config).await?;
    let count = stack.main_context()?.count(&entity)?;

    match output.format {
        OutputFormat::Json => output.json(serde_json::json!({
            "entity": entity,
            "count": count,
        })),
        OutputFormat::Quiet => println!("{}", count),
        OutputFormat::Human => println!("{}: {}", entity, count),
    }
    Ok(())
}

pub async fn list(config: StackConfig, entity: String, output: &Output) -> Result<()> {
    let (stack, _) = open_stack(config).await?;
    let objects = stack.main_context()?.fetch_all(&entity)?;
    output.print_objects(&entity, &objects);
    Ok(())
}

/// Delete one object by its permanent id
pub async fn delete(
    config: StackConfig,
    entity: String,
    id: String,
    output: &Output,
) -> Result<()> {
    let id = ObjectId::from_store_key(&id).ok_or_else(|| anyhow!("Invalid object id: {}", id))?;
    let (stack, _) = open_stack(config).await?;

    let worker = stack.worker_context()?;
    let object = worker
        .object(id)?
        .filter(|object| object.entity == entity)
        .ok_or_else(|| anyhow!("No {} object with id {}", entity, id))?;
    worker.delete(object.id)?;
    save(&stack, &worker)?;

    output.success(&format!("Deleted {} {}", entity, id));
    Ok(())
}
