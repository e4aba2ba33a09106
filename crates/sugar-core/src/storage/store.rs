//! The disk-backed persistent store
//!
//! Owned by the root context and only ever touched from the root lane.
//! Opening applies the journal mode, creates the tables and checks the model
//! version hash recorded in the store against the current model.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::StoreOpenError;
use crate::model::Model;
use crate::object::{ChangeSet, ManagedObject, ObjectId, Properties};
use crate::storage::files::create_parent_dir;
use crate::storage::schema::{get_metadata, init_schema, keys, needs_init, set_metadata};

/// Hash recorded for stores opened without an explicit model
pub const UNVERSIONED_MODEL_HASH: &str = "unversioned";

/// SQLite journal mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Wal,
    Delete,
}

impl JournalMode {
    pub fn as_pragma(&self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
        }
    }
}

/// Keys attached to a cloud-synced store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudContentOptions {
    /// Sync identity of the store's content
    pub content_name: String,
    /// Where the transaction logs for sync live
    pub content_location: PathBuf,
}

/// Options used when attaching a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub automatic_migration: bool,
    pub infer_mapping: bool,
    pub journal_mode: JournalMode,
    pub cloud_content: Option<CloudContentOptions>,
}

impl StoreOptions {
    pub fn for_automigration(automigrating: bool) -> Self {
        Self {
            automatic_migration: automigrating,
            infer_mapping: automigrating,
            journal_mode: JournalMode::Wal,
            cloud_content: None,
        }
    }

    /// Non-migrating options with WAL journaling
    pub fn plain() -> Self {
        Self::for_automigration(false)
    }

    pub fn cloud(content_name: impl Into<String>, content_location: impl Into<PathBuf>) -> Self {
        Self {
            cloud_content: Some(CloudContentOptions {
                content_name: content_name.into(),
                content_location: content_location.into(),
            }),
            ..Self::for_automigration(true)
        }
    }

    /// Same options with migration turned off
    pub fn without_migration(&self) -> Self {
        Self {
            automatic_migration: false,
            infer_mapping: false,
            ..self.clone()
        }
    }
}

/// An opened SQLite store
pub struct PersistentStore {
    path: PathBuf,
    model_hash: String,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("path", &self.path)
            .field("model_hash", &self.model_hash)
            .finish()
    }
}

impl PersistentStore {
    /// Open or create the store at `path`
    pub(crate) fn attach(
        path: &Path,
        model: Option<&Model>,
        options: &StoreOptions,
    ) -> Result<Self, StoreOpenError> {
        let db_err = |source| StoreOpenError::Database {
            path: path.to_path_buf(),
            source,
        };

        create_parent_dir(path).map_err(|source| StoreOpenError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut conn = Connection::open(path).map_err(db_err)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", options.journal_mode.as_pragma(), |row| {
                row.get(0)
            })
            .map_err(db_err)?;
        debug!("Store {:?} journal mode: {}", path, mode);

        if needs_init(&conn).map_err(db_err)? {
            init_schema(&conn).map_err(db_err)?;
        }

        let stored = get_metadata(&conn, keys::MODEL_HASH).map_err(db_err)?;
        let model_hash = match (model, stored) {
            (None, Some(stored)) => stored,
            (None, None) => {
                set_metadata(&conn, keys::MODEL_HASH, UNVERSIONED_MODEL_HASH).map_err(db_err)?;
                UNVERSIONED_MODEL_HASH.to_string()
            }
            (Some(model), None) => {
                let current = model.version_hash();
                set_metadata(&conn, keys::MODEL_HASH, &current).map_err(db_err)?;
                current
            }
            (Some(model), Some(stored)) => {
                let current = model.version_hash();
                if stored != current {
                    if !options.automatic_migration {
                        return Err(StoreOpenError::IncompatibleVersionHash {
                            path: path.to_path_buf(),
                            stored,
                            current,
                        });
                    }
                    if !options.infer_mapping || model.source_version(&stored).is_none() {
                        return Err(StoreOpenError::MissingSourceModel {
                            path: path.to_path_buf(),
                            stored,
                        });
                    }
                    let dropped = migrate_in_place(&mut conn, model).map_err(db_err)?;
                    info!(
                        "Migrated store {:?} from model {} to {} ({} objects dropped)",
                        path, stored, current, dropped
                    );
                }
                current
            }
        };

        if let Some(ref cloud) = options.cloud_content {
            set_metadata(&conn, keys::CLOUD_CONTENT_NAME, &cloud.content_name).map_err(db_err)?;
            set_metadata(
                &conn,
                keys::CLOUD_CONTENT_LOCATION,
                &cloud.content_location.to_string_lossy(),
            )
            .map_err(db_err)?;
        }

        if get_metadata(&conn, keys::CREATED_AT).map_err(db_err)?.is_none() {
            set_metadata(&conn, keys::CREATED_AT, &Utc::now().to_rfc3339()).map_err(db_err)?;
        }
        checkpoint(&conn).map_err(db_err)?;

        Ok(Self {
            path: path.to_path_buf(),
            model_hash,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Model version hash the store is bound to
    pub fn model_hash(&self) -> &str {
        &self.model_hash
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Only the root lane uses the connection; a poisoned lock still
        // guards a usable connection.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn metadata(&self, key: &str) -> rusqlite::Result<Option<String>> {
        get_metadata(&self.conn(), key)
    }

    /// All stored objects of an entity
    pub fn fetch_entity(&self, entity: &str) -> rusqlite::Result<Vec<ManagedObject>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, entity, properties FROM objects WHERE entity = ? ORDER BY id")?;
        let objects = stmt
            .query_map(params![entity], row_to_object)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(objects)
    }

    pub fn fetch_object(&self, id: &ObjectId) -> rusqlite::Result<Option<ManagedObject>> {
        let Some(key) = id.store_key() else {
            return Ok(None);
        };
        self.conn()
            .query_row(
                "SELECT id, entity, properties FROM objects WHERE id = ?",
                params![key],
                row_to_object,
            )
            .optional()
    }

    pub fn count(&self, entity: &str) -> rusqlite::Result<i64> {
        self.conn().query_row(
            "SELECT COUNT(*) FROM objects WHERE entity = ?",
            params![entity],
            |row| row.get(0),
        )
    }

    /// Write a change set in one transaction
    pub(crate) fn apply(&self, changes: &ChangeSet) -> rusqlite::Result<()> {
        let mut conn = self.conn();
        let now = Utc::now().timestamp_millis();
        let tx = conn.transaction()?;

        for object in changes.inserted.values() {
            tx.execute(
                "INSERT OR REPLACE INTO objects (id, entity, properties, updated_at) VALUES (?, ?, ?, ?)",
                params![
                    key_of(&object.id)?,
                    object.entity,
                    to_json(&object.properties)?,
                    now
                ],
            )?;
        }

        for change in changes.updated.values() {
            let key = key_of(&change.id)?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT properties FROM objects WHERE id = ?",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(json) = existing else {
                warn!("Skipping update of {}: object is not in the store", change.id);
                continue;
            };
            let mut properties = from_json(&json, 0)?;
            properties.extend(change.values.clone());
            tx.execute(
                "UPDATE objects SET properties = ?, updated_at = ? WHERE id = ?",
                params![to_json(&properties)?, now, key],
            )?;
        }

        for id in changes.deleted.keys() {
            tx.execute("DELETE FROM objects WHERE id = ?", params![key_of(id)?])?;
        }

        tx.commit()?;
        checkpoint(&conn)
    }
}

/// Move committed WAL frames into the primary file
fn checkpoint(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
}

/// Lightweight migration: drop what the current model no longer describes
fn migrate_in_place(conn: &mut Connection, model: &Model) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    let rows: Vec<(String, String, String)> = {
        let mut stmt = tx.prepare("SELECT id, entity, properties FROM objects")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut dropped = 0;
    for (id, entity, json) in rows {
        match model.entity_description(&entity) {
            None => {
                tx.execute("DELETE FROM objects WHERE id = ?", params![id])?;
                dropped += 1;
            }
            Some(description) => {
                let mut properties = from_json(&json, 2)?;
                let before = properties.len();
                properties.retain(|key, _| description.allows(key));
                if properties.len() != before {
                    tx.execute(
                        "UPDATE objects SET properties = ? WHERE id = ?",
                        params![to_json(&properties)?, id],
                    )?;
                }
            }
        }
    }

    set_metadata(&tx, keys::MODEL_HASH, &model.version_hash())?;
    tx.commit()?;
    Ok(dropped)
}

fn row_to_object(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManagedObject> {
    let key: String = row.get(0)?;
    let id = ObjectId::from_store_key(&key).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            format!("invalid object id '{}'", key).into(),
        )
    })?;
    let json: String = row.get(2)?;
    Ok(ManagedObject {
        id,
        entity: row.get(1)?,
        properties: from_json(&json, 2)?,
    })
}

fn key_of(id: &ObjectId) -> rusqlite::Result<String> {
    id.store_key().ok_or_else(|| {
        rusqlite::Error::ToSqlConversionFailure(
            format!("temporary identity {} cannot be stored", id).into(),
        )
    })
}

fn to_json(properties: &Properties) -> rusqlite::Result<String> {
    serde_json::to_string(properties)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json(json: &str, column: usize) -> rusqlite::Result<Properties> {
    serde_json::from_str(json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}
