//! SQLite schema of the on-disk store
//!
//! Objects are stored as JSON property maps in a single table. The model
//! version hash the store was created for lives in `sugar_metadata`.

use rusqlite::{params, Connection, OptionalExtension, Result};

/// Version of sugar's own table layout
pub const SCHEMA_VERSION: i32 = 1;

/// Keys used in the `sugar_metadata` table
pub mod keys {
    pub const LAYOUT_VERSION: &str = "layout_version";
    pub const MODEL_HASH: &str = "model_hash";
    pub const CREATED_AT: &str = "created_at";
    pub const CLOUD_CONTENT_NAME: &str = "cloud_content_name";
    pub const CLOUD_CONTENT_LOCATION: &str = "cloud_content_location";
}

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sugar_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS objects (
            id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            properties TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_objects_entity ON objects(entity);
        "#,
    )?;

    set_metadata(conn, keys::LAYOUT_VERSION, &SCHEMA_VERSION.to_string())
}

/// Read a metadata value
pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM sugar_metadata WHERE key = ?",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

/// Write a metadata value
pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sugar_metadata (key, value) VALUES (?, ?)",
        params![key, value],
    )?;
    Ok(())
}

/// Get the table layout version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    Ok(get_metadata(conn, keys::LAYOUT_VERSION)?.and_then(|v| v.parse().ok()))
}

/// Check if the tables need to be created
pub fn needs_init(conn: &Connection) -> Result<bool> {
    let table_exists = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='sugar_metadata'")?
        .exists([])?;

    if !table_exists {
        return Ok(true);
    }

    Ok(match get_schema_version(conn)? {
        Some(v) => v < SCHEMA_VERSION,
        None => true,
    })
}
