//! SQLite state store for the adapter daemon.
//!
//! One row per resource in `resource_state`; the per-metric counters are kept
//! as a JSON document so both metrics of a resource commit in a single write.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use milestone_core::store::{StateStore, StoreError, WriteCondition};
use milestone_core::{MetricState, ResourceId, ResourceState};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Explicit column list for resource_state queries.
const STATE_COLUMNS: &str = "id, metrics_json, version, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error for {resource_id}: {source}")]
    Serialization {
        resource_id: String,
        source: serde_json::Error,
    },
    #[error("version conflict for {resource_id}: expected {expected}, found {found}")]
    Conflict {
        resource_id: String,
        expected: u64,
        found: u64,
    },
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Conflict {
                resource_id,
                expected,
                found,
            } => StoreError::Conflict {
                resource_id,
                expected,
                found,
            },
            StorageError::Serialization {
                resource_id,
                source,
            } => StoreError::Corrupt {
                resource_id,
                message: source.to_string(),
            },
            StorageError::Database(e) => StoreError::Backend(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// SQLite-backed state store.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Enable WAL mode
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            // Remove comment lines before splitting.
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    sqlx::query(trimmed).execute(&self.pool).await?;
                }
            }
        }
        Ok(())
    }

    /// Get the stored state for a resource.
    pub async fn get_state(&self, id: &ResourceId) -> Result<Option<ResourceState>> {
        let query = format!("SELECT {STATE_COLUMNS} FROM resource_state WHERE id = ?1");
        let row = sqlx::query_as::<_, StateRow>(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(StateRow::into_state).transpose()
    }

    /// Write a resource's state, subject to `condition`.
    ///
    /// Returns the committed state with its new version.
    pub async fn upsert_state(
        &self,
        state: &ResourceState,
        condition: WriteCondition,
    ) -> Result<ResourceState> {
        let id = state.resource_id.as_str();
        let metrics_json =
            serde_json::to_string(&state.metrics).map_err(|source| StorageError::Serialization {
                resource_id: id.to_string(),
                source,
            })?;
        let now = Utc::now();
        let ts = now.timestamp_millis();

        let version: Option<(i64,)> = match condition {
            WriteCondition::IfVersion(0) => {
                sqlx::query_as(
                    "INSERT INTO resource_state (id, metrics_json, version, created_at, updated_at) \
                     VALUES (?1, ?2, 1, ?3, ?3) ON CONFLICT(id) DO NOTHING RETURNING version",
                )
                .bind(id)
                .bind(&metrics_json)
                .bind(ts)
                .fetch_optional(&self.pool)
                .await?
            }
            WriteCondition::IfVersion(expected) => {
                sqlx::query_as(
                    "UPDATE resource_state SET metrics_json = ?1, version = version + 1, \
                     updated_at = ?2 WHERE id = ?3 AND version = ?4 RETURNING version",
                )
                .bind(&metrics_json)
                .bind(ts)
                .bind(id)
                .bind(expected as i64)
                .fetch_optional(&self.pool)
                .await?
            }
            WriteCondition::Always => {
                sqlx::query_as(
                    "INSERT INTO resource_state (id, metrics_json, version, created_at, updated_at) \
                     VALUES (?1, ?2, 1, ?3, ?3) \
                     ON CONFLICT(id) DO UPDATE SET metrics_json = excluded.metrics_json, \
                     version = resource_state.version + 1, updated_at = excluded.updated_at \
                     RETURNING version",
                )
                .bind(id)
                .bind(&metrics_json)
                .bind(ts)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let Some((version,)) = version else {
            let expected = match condition {
                WriteCondition::IfVersion(v) => v,
                WriteCondition::Always => 0,
            };
            return Err(StorageError::Conflict {
                resource_id: id.to_string(),
                expected,
                found: self.current_version(&state.resource_id).await?,
            });
        };

        debug!(resource_id = %id, version, "state persisted");
        Ok(ResourceState {
            resource_id: state.resource_id.clone(),
            metrics: state.metrics.clone(),
            version: version as u64,
            updated_at: DateTime::from_timestamp_millis(ts),
        })
    }

    /// Delete a resource's state. Returns true if a row was removed.
    pub async fn delete_state(&self, id: &ResourceId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resource_state WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count stored resources.
    #[cfg(test)]
    pub async fn count_states(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resource_state")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as usize)
    }

    async fn current_version(&self, id: &ResourceId) -> Result<u64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM resource_state WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map_or(0, |(v,)| v as u64))
    }
}

#[async_trait]
impl StateStore for Storage {
    async fn get(
        &self,
        resource_id: &ResourceId,
    ) -> milestone_core::store::Result<Option<ResourceState>> {
        Ok(self.get_state(resource_id).await?)
    }

    async fn upsert(
        &self,
        state: &ResourceState,
        condition: WriteCondition,
    ) -> milestone_core::store::Result<ResourceState> {
        Ok(self.upsert_state(state, condition).await?)
    }

    async fn delete(&self, resource_id: &ResourceId) -> milestone_core::store::Result<bool> {
        Ok(self.delete_state(resource_id).await?)
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct StateRow {
    id: String,
    metrics_json: String,
    version: i64,
    #[allow(dead_code)]
    created_at: i64,
    updated_at: i64,
}

impl StateRow {
    fn into_state(self) -> Result<ResourceState> {
        let metrics: BTreeMap<String, MetricState> = serde_json::from_str(&self.metrics_json)
            .map_err(|source| StorageError::Serialization {
                resource_id: self.id.clone(),
                source,
            })?;

        Ok(ResourceState {
            resource_id: ResourceId::new(self.id),
            metrics,
            version: self.version as u64,
            updated_at: DateTime::from_timestamp_millis(self.updated_at),
        })
    }
}
