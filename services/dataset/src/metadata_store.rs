use crate::codec::FileFormat;
use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Where a stored file came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Uploaded by a user
    Active,
    /// Produced by committing a merge result
    Merged,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Active => "active",
            FileStatus::Merged => "merged",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(FileStatus::Active),
            "merged" => Ok(FileStatus::Merged),
            other => anyhow::bail!("unknown file status '{other}'"),
        }
    }
}

/// Stored file metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Unique file ID
    pub id: Uuid,
    /// Original file name
    pub name: String,
    /// File format
    pub format: FileFormat,
    /// Object store key holding the bytes
    pub storage_key: String,
    /// File size in bytes
    pub size_bytes: i64,
    /// Free-form description
    pub description: String,
    /// Who uploaded the file
    pub uploaded_by: String,
    /// Upload or merge origin
    pub status: FileStatus,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Row shape of the `files` table
#[derive(Debug, FromRow)]
struct FileRow {
    id: Uuid,
    name: String,
    format: String,
    storage_key: String,
    size_bytes: i64,
    description: String,
    uploaded_by: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = anyhow::Error;

    fn try_from(row: FileRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            format: row
                .format
                .parse()
                .map_err(|e| anyhow::anyhow!("file {}: {e}", row.id))?,
            status: row.status.parse()?,
            name: row.name,
            storage_key: row.storage_key,
            size_bytes: row.size_bytes,
            description: row.description,
            uploaded_by: row.uploaded_by,
            created_at: row.created_at,
        })
    }
}

/// CRUD access to file records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record
    async fn insert(&self, record: &FileRecord) -> Result<()>;

    /// Fetch a record by ID
    async fn get(&self, id: Uuid) -> Result<Option<FileRecord>>;

    /// All records in creation order
    async fn list(&self) -> Result<Vec<FileRecord>>;

    /// Delete a record, returning whether it existed
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Check connectivity
    async fn ping(&self) -> Result<()>;
}

/// Metadata store backed by PostgreSQL
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, record), fields(file_id = %record.id, name = %record.name))]
    async fn insert(&self, record: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, name, format, storage_key, size_bytes,
                description, uploaded_by, status, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9
            )
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(record.format.as_str())
        .bind(&record.storage_key)
        .bind(record.size_bytes)
        .bind(&record.description)
        .bind(&record.uploaded_by)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert file record")?;

        debug!(storage_key = %record.storage_key, "File record inserted");

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT id, name, format, storage_key, size_bytes,
                   description, uploaded_by, status, created_at
            FROM files
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query file record")?;

        row.map(FileRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT id, name, format, storage_key, size_bytes,
                   description, uploaded_by, status, created_at
            FROM files
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list file records")?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete file record")?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}
