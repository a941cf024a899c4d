//! SQLite-backed configuration repository.
//!
//! Each configuration is stored as its JSON document. The columns next to it
//! (`class_name`, `name`, `connector_id`) only exist to serve lookups and are
//! rewritten whenever the document changes.

use super::ConfigRepository;
use crate::model::{ConfigKind, ConfigPatch, Configuration};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Persists configuration documents in SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE configurations (
///     id           TEXT PRIMARY KEY,
///     class_name   TEXT NOT NULL,
///     name         TEXT NOT NULL,
///     scope_id     TEXT NOT NULL,
///     connector_id TEXT,           -- streams only
///     document     TEXT NOT NULL,  -- JSON
///     created_at   TEXT NOT NULL,
///     updated_at   TEXT NOT NULL
/// );
/// ```
pub struct SqliteConfigRepository {
    conn: Mutex<Connection>,
}

impl SqliteConfigRepository {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).with_context(|| {
            format!(
                "Failed to open configuration DB at {}",
                db_path.as_ref().display()
            )
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_table()?;
        Ok(store)
    }

    /// Creates the `configurations` table if it does not already exist.
    fn create_table(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS configurations (
                id           TEXT PRIMARY KEY,
                class_name   TEXT NOT NULL,
                name         TEXT NOT NULL,
                scope_id     TEXT NOT NULL,
                connector_id TEXT,
                document     TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_configurations_class ON configurations(class_name);
            CREATE INDEX IF NOT EXISTS idx_configurations_name ON configurations(name);
            CREATE INDEX IF NOT EXISTS idx_configurations_connector ON configurations(connector_id);",
        )
        .context("Failed to create configurations table")?;
        Ok(())
    }

    /// Runs a document query and decodes every row, skipping unreadable ones.
    fn query_documents(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Configuration>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut configs = Vec::new();
        for row in rows {
            let (id, document) = row.context("Failed to read configuration row")?;
            match serde_json::from_str::<Configuration>(&document) {
                Ok(config) => configs.push(config),
                Err(e) => warn!(config_id = %id, error = %e, "Skipping unreadable configuration document"),
            }
        }
        Ok(configs)
    }
}

#[async_trait]
impl ConfigRepository for SqliteConfigRepository {
    async fn find_all_configurations(&self) -> Result<Vec<Configuration>> {
        self.query_documents(
            "SELECT id, document FROM configurations ORDER BY created_at ASC, id ASC",
            &[],
        )
        .context("Failed to list configurations")
    }

    async fn find_configuration_by_id(&self, id: &str) -> Result<Option<Configuration>> {
        let conn = self.conn.lock().unwrap();
        let document: Option<String> = conn
            .query_row(
                "SELECT document FROM configurations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query configuration")?;

        document
            .map(|doc| {
                serde_json::from_str(&doc)
                    .with_context(|| format!("Configuration '{}' is not a valid document", id))
            })
            .transpose()
    }

    async fn find_configurations_by_name(&self, name: &str) -> Result<Vec<Configuration>> {
        self.query_documents(
            "SELECT id, document FROM configurations WHERE name = ?1 ORDER BY created_at ASC",
            &[&name],
        )
    }

    async fn find_configurations_by_kind(&self, kind: ConfigKind) -> Result<Vec<Configuration>> {
        self.query_documents(
            "SELECT id, document FROM configurations WHERE class_name = ?1 ORDER BY created_at ASC",
            &[&kind.class_name()],
        )
    }

    async fn find_streams_by_connector(&self, connector_id: &str) -> Result<Vec<Configuration>> {
        self.query_documents(
            "SELECT id, document FROM configurations WHERE connector_id = ?1 ORDER BY created_at ASC",
            &[&connector_id],
        )
    }

    async fn save_configuration(&self, config: &Configuration) -> Result<()> {
        let document = serde_json::to_string(config).context("Failed to serialize configuration")?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO configurations
                (id, class_name, name, scope_id, connector_id, document, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                config.id(),
                config.kind().class_name(),
                config.name(),
                config.scope_id(),
                config.connector_id(),
                document,
                now,
            ],
        )
        .with_context(|| format!("Failed to insert configuration '{}'", config.id()))?;
        Ok(())
    }

    async fn update_configuration(&self, id: &str, patch: &ConfigPatch) -> Result<Configuration> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let document: String = tx
            .query_row(
                "SELECT document FROM configurations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("Configuration '{}' not found", id))?;

        let mut config: Configuration = serde_json::from_str(&document)
            .with_context(|| format!("Configuration '{}' is not a valid document", id))?;
        patch.apply(&mut config)?;

        let updated = serde_json::to_string(&config).context("Failed to serialize configuration")?;
        tx.execute(
            "UPDATE configurations
             SET name = ?2, scope_id = ?3, connector_id = ?4, document = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                config.name(),
                config.scope_id(),
                config.connector_id(),
                updated,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit().context("Failed to commit configuration update")?;
        Ok(config)
    }

    async fn delete_configuration(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute("DELETE FROM configurations WHERE id = ?1", params![id])
            .context("Failed to delete configuration")?;
        Ok(removed > 0)
    }
}
