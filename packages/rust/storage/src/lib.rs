//! libSQL catalog storage for the oerflow pipeline.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the
//! production and staging material catalogs plus the partial-capture store.
//! Catalog writes are idempotent upserts keyed on `material_url`; partial
//! snapshots upsert on `(material_url, stage)` so redeliveries overwrite
//! rather than duplicate.

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde_json::{Map, Value};

use oerflow_shared::config::StorageConfig;
use oerflow_shared::{Material, PartialSnapshot, PipelineError, Result};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`, run pending migrations, and
    /// make sure the tables named in `config` exist.
    pub async fn open(path: &Path, config: &StorageConfig) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        storage.ensure_tables(config).await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    PipelineError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Create any configured tables the base migration did not, so sinks can
    /// be pointed at alternative table names without a schema migration.
    async fn ensure_tables(&self, config: &StorageConfig) -> Result<()> {
        for table in [&config.production_table, &config.staging_table] {
            check_table_name(table)?;
            self.conn
                .execute(&migrations::catalog_table_ddl(table), params![])
                .await
                .map_err(|e| PipelineError::Storage(e.to_string()))?;
        }
        check_table_name(&config.partial_table)?;
        self.conn
            .execute(&migrations::partial_table_ddl(&config.partial_table), params![])
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Catalog operations
    // -----------------------------------------------------------------------

    /// Upsert a material into a catalog table, keyed on `material_url`.
    ///
    /// A redelivered record overwrites the previous row, so at-least-once
    /// delivery upstream never produces duplicate catalog entries.
    pub async fn upsert_material(&self, table: &str, material: &Material) -> Result<()> {
        check_table_name(table)?;

        let authors = serde_json::to_string(&material.authors)
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        let metadata = serde_json::to_string(&material.material_metadata)
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let sql = format!(
            "INSERT INTO {table}
               (material_url, provider_uri, title, description, authors, language,
                creation_date, retrieved_date, material_type, mimetype, license,
                material_metadata, validation_status, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(material_url) DO UPDATE SET
               provider_uri      = excluded.provider_uri,
               title             = excluded.title,
               description       = excluded.description,
               authors           = excluded.authors,
               language          = excluded.language,
               creation_date     = excluded.creation_date,
               retrieved_date    = excluded.retrieved_date,
               material_type     = excluded.material_type,
               mimetype          = excluded.mimetype,
               license           = excluded.license,
               material_metadata = excluded.material_metadata,
               validation_status = excluded.validation_status,
               message           = excluded.message"
        );

        self.conn
            .execute(
                &sql,
                params![
                    material.material_url().as_str(),
                    material.provider_uri.as_deref(),
                    material.title.as_deref(),
                    material.description.as_deref(),
                    authors.as_str(),
                    material.language.as_deref(),
                    material.creation_date.map(|d| d.to_rfc3339()),
                    material.retrieved_date.to_rfc3339(),
                    material.material_type.as_deref(),
                    material.mimetype.as_deref(),
                    material.license.as_deref(),
                    metadata.as_str(),
                    material.validation.label(),
                    material.message.as_deref(),
                ],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a catalog row by material URL.
    pub async fn get_material(&self, table: &str, material_url: &str) -> Result<Option<CatalogRow>> {
        check_table_name(table)?;
        let sql = format!(
            "SELECT material_url, title, language, material_type, retrieved_date,
                    material_metadata, validation_status, message
             FROM {table} WHERE material_url = ?1"
        );
        let mut rows = self
            .conn
            .query(&sql, params![material_url])
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_catalog(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Count rows in a catalog table.
    pub async fn count_materials(&self, table: &str) -> Result<u64> {
        check_table_name(table)?;
        self.count(&format!("SELECT COUNT(*) FROM {table}")).await
    }

    // -----------------------------------------------------------------------
    // Partial-capture operations
    // -----------------------------------------------------------------------

    /// Upsert a partial snapshot, keyed on `(material_url, stage)`. Each
    /// stage keeps at most one snapshot per material; redeliveries overwrite.
    pub async fn upsert_partial(&self, table: &str, snapshot: &PartialSnapshot) -> Result<()> {
        check_table_name(table)?;

        let material_json = serde_json::to_string(&snapshot.material)
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let sql = format!(
            "INSERT INTO {table} (material_url, stage, captured_at, message, material_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(material_url, stage) DO UPDATE SET
               captured_at   = excluded.captured_at,
               message       = excluded.message,
               material_json = excluded.material_json"
        );

        self.conn
            .execute(
                &sql,
                params![
                    snapshot.material.material_url().as_str(),
                    snapshot.stage.as_str(),
                    snapshot.captured_at.to_rfc3339(),
                    snapshot.message.as_deref(),
                    material_json.as_str(),
                ],
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get one partial snapshot by material URL and stage name.
    pub async fn get_partial(
        &self,
        table: &str,
        material_url: &str,
        stage: &str,
    ) -> Result<Option<PartialSnapshot>> {
        check_table_name(table)?;
        let sql = format!(
            "SELECT captured_at, message, material_json
             FROM {table} WHERE material_url = ?1 AND stage = ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![material_url, stage])
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let captured_at: String = row
                    .get(0)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?;
                let message: Option<String> = row.get(1).ok();
                let json: String = row
                    .get(2)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?;
                let material: Material = serde_json::from_str(&json)
                    .map_err(|e| PipelineError::Storage(format!("invalid snapshot json: {e}")))?;
                Ok(Some(PartialSnapshot {
                    stage: stage.to_string(),
                    captured_at: chrono::DateTime::parse_from_rfc3339(&captured_at)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .map_err(|e| PipelineError::Storage(format!("invalid date: {e}")))?,
                    message,
                    material,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }

    /// Names of the stages that captured a snapshot for this material.
    pub async fn list_partial_stages(
        &self,
        table: &str,
        material_url: &str,
    ) -> Result<Vec<String>> {
        check_table_name(table)?;
        let sql = format!(
            "SELECT stage FROM {table} WHERE material_url = ?1 ORDER BY captured_at"
        );
        let mut rows = self
            .conn
            .query(&sql, params![material_url])
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let mut stages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            stages.push(
                row.get::<String>(0)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?,
            );
        }
        Ok(stages)
    }

    /// Count rows in a partial-capture table.
    pub async fn count_partials(&self, table: &str) -> Result<u64> {
        check_table_name(table)?;
        self.count(&format!("SELECT COUNT(*) FROM {table}")).await
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(sql, params![])
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<u64>(0)
                .map_err(|e| PipelineError::Storage(e.to_string())),
            Ok(None) => Ok(0),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }
}

/// A catalog row as read back from storage.
#[derive(Debug, Clone)]
pub struct CatalogRow {
    pub material_url: String,
    pub title: Option<String>,
    pub language: Option<String>,
    pub material_type: Option<String>,
    pub retrieved_date: DateTime<Utc>,
    pub material_metadata: Map<String, Value>,
    pub validation_status: String,
    pub message: Option<String>,
}

/// Tables come from config, not user input, but they still end up spliced
/// into SQL; accept plain identifiers only.
fn check_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(PipelineError::Storage(format!(
            "invalid table name '{table}'"
        )))
    }
}

/// Convert a database row to a [`CatalogRow`].
fn row_to_catalog(row: &libsql::Row) -> Result<CatalogRow> {
    let metadata_json: String = row
        .get(5)
        .map_err(|e| PipelineError::Storage(e.to_string()))?;
    let material_metadata: Map<String, Value> = serde_json::from_str(&metadata_json)
        .map_err(|e| PipelineError::Storage(format!("invalid metadata json: {e}")))?;

    Ok(CatalogRow {
        material_url: row
            .get::<String>(0)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        title: row.get::<String>(1).ok(),
        language: row.get::<String>(2).ok(),
        material_type: row.get::<String>(3).ok(),
        retrieved_date: {
            let s: String = row
                .get(4)
                .map_err(|e| PipelineError::Storage(e.to_string()))?;
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| PipelineError::Storage(format!("invalid date: {e}")))?
        },
        material_metadata,
        validation_status: row
            .get::<String>(6)
            .map_err(|e| PipelineError::Storage(e.to_string()))?,
        message: row.get::<String>(7).ok(),
    })
}
