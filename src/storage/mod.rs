//! Durable configuration storage.
//!
//! The manager only needs CRUD plus a few lookups; [`SqliteConfigRepository`]
//! is the shipped implementation.

mod sqlite;

pub use sqlite::SqliteConfigRepository;

use crate::model::{ConfigKind, ConfigPatch, Configuration};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn find_all_configurations(&self) -> Result<Vec<Configuration>>;

    async fn find_configuration_by_id(&self, id: &str) -> Result<Option<Configuration>>;

    async fn find_configurations_by_name(&self, name: &str) -> Result<Vec<Configuration>>;

    async fn find_configurations_by_kind(&self, kind: ConfigKind) -> Result<Vec<Configuration>>;

    /// Consumers and producers referencing `connector_id`.
    async fn find_streams_by_connector(&self, connector_id: &str) -> Result<Vec<Configuration>>;

    /// Inserts a new configuration. Fails if the id already exists.
    async fn save_configuration(&self, config: &Configuration) -> Result<()>;

    /// Applies a typed patch and returns the stored result.
    async fn update_configuration(&self, id: &str, patch: &ConfigPatch) -> Result<Configuration>;

    /// Returns true if a row was removed.
    async fn delete_configuration(&self, id: &str) -> Result<bool>;
}
