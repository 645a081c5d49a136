//! Dataset workflow coordinator.
//!
//! [`DatasetService`] is the only component that talks to the metadata store,
//! the object store, the codecs and the merge cache. Every user-facing
//! operation is one method here.
//!
//! Uploads and commits write the object first and the metadata record
//! second. The two stores share no transaction: if the record insert fails
//! the object is deleted again, and if that cleanup also fails the orphaned
//! key is logged.

use crate::codec::FileFormat;
use crate::config::Config;
use crate::error::{DatasetError, DatasetResult};
use crate::join::{join, JoinType};
use crate::merge_cache::{MergeCache, MergeSpec};
use crate::metadata_store::{FileRecord, FileStatus, MetadataStore};
use crate::object_store::{generate_storage_key, ObjectStore};
use crate::table::{normalize_column_name, Table};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Recorded as the uploader of committed merge results
const MERGE_UPLOADER: &str = "system";

/// Request limits and defaults applied by the service
#[derive(Debug, Clone)]
pub struct ServiceLimits {
    pub max_file_bytes: usize,
    pub max_page_size: usize,
    pub preview_rows: usize,
    pub default_uploaded_by: String,
}

impl ServiceLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_bytes: config.upload.max_file_bytes,
            max_page_size: config.api.max_page_size,
            preview_rows: config.api.preview_rows,
            default_uploaded_by: config.upload.default_uploaded_by.clone(),
        }
    }
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 100 * 1024 * 1024,
            max_page_size: 1000,
            preview_rows: 5,
            default_uploaded_by: "anonymous".to_string(),
        }
    }
}

/// A file to upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub bytes: Vec<u8>,
    pub uploaded_by: Option<String>,
    pub description: Option<String>,
}

/// Parameters of a merge
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub left_id: Uuid,
    pub right_id: Uuid,
    pub join_column: String,
    pub join_type: JoinType,
}

/// Result of a merge; the full table stays in the cache
#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub cache_key: String,
    pub join_column: String,
    pub join_type: JoinType,
    pub row_count: usize,
    pub column_names: Vec<String>,
    /// First rows of the result, in `column_names` order
    pub preview: Vec<Vec<serde_json::Value>>,
    pub expires_at: DateTime<Utc>,
}

/// One page of a cached merge result
#[derive(Debug, Clone, Serialize)]
pub struct PreviewPage {
    pub cache_key: String,
    pub page: usize,
    pub page_size: usize,
    pub total_rows: usize,
    pub total_pages: usize,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub expires_at: DateTime<Utc>,
}

/// A stored file with its content
#[derive(Debug, Clone)]
pub struct Download {
    pub record: FileRecord,
    pub bytes: Vec<u8>,
}

/// Fields of a record about to be written
struct NewFile {
    name: String,
    format: FileFormat,
    bytes: Vec<u8>,
    uploaded_by: String,
    description: String,
    status: FileStatus,
}

/// Coordinates uploads, merges, previews, commits and deletes
#[derive(Clone)]
pub struct DatasetService {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    cache: Arc<MergeCache>,
    limits: ServiceLimits,
}

impl DatasetService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        cache: Arc<MergeCache>,
        limits: ServiceLimits,
    ) -> Self {
        Self {
            metadata,
            objects,
            cache,
            limits,
        }
    }

    pub fn limits(&self) -> &ServiceLimits {
        &self.limits
    }

    /// Check that the metadata store is reachable
    pub async fn ready(&self) -> DatasetResult<()> {
        self.metadata.ping().await.map_err(DatasetError::read)
    }

    /// Store a new CSV or XLSX file
    #[instrument(skip(self, request), fields(name = %request.name, size_bytes = request.bytes.len()))]
    pub async fn upload(&self, request: UploadRequest) -> DatasetResult<FileRecord> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(DatasetError::InvalidRequest("file name is required".to_string()));
        }
        if request.bytes.is_empty() {
            return Err(DatasetError::InvalidRequest(format!("'{name}' is empty")));
        }
        if request.bytes.len() > self.limits.max_file_bytes {
            return Err(DatasetError::InvalidRequest(format!(
                "'{name}' is {} bytes, the limit is {}",
                request.bytes.len(),
                self.limits.max_file_bytes
            )));
        }

        let format = FileFormat::detect(&name, &request.bytes)?;

        let record = self
            .store(NewFile {
                name,
                format,
                bytes: request.bytes,
                uploaded_by: non_blank(request.uploaded_by)
                    .unwrap_or_else(|| self.limits.default_uploaded_by.clone()),
                description: non_blank(request.description).unwrap_or_default(),
                status: FileStatus::Active,
            })
            .await?;

        metrics::counter!("datasets.uploaded").increment(1);
        info!(file_id = %record.id, format = %record.format, "File uploaded");

        Ok(record)
    }

    /// All files in creation order
    pub async fn list_files(&self) -> DatasetResult<Vec<FileRecord>> {
        self.metadata.list().await.map_err(DatasetError::read)
    }

    pub async fn get_file(&self, id: Uuid) -> DatasetResult<FileRecord> {
        self.metadata
            .get(id)
            .await
            .map_err(DatasetError::read)?
            .ok_or(DatasetError::RecordNotFound(id))
    }

    /// A file's record together with its stored bytes
    #[instrument(skip(self))]
    pub async fn download(&self, id: Uuid) -> DatasetResult<Download> {
        let record = self.get_file(id).await?;
        let bytes = self.fetch_bytes(&record).await?;
        Ok(Download { record, bytes })
    }

    /// Join two stored files and cache the result
    #[instrument(skip(self), fields(left_id = %request.left_id, right_id = %request.right_id))]
    pub async fn merge(&self, request: MergeRequest) -> DatasetResult<MergeSummary> {
        let join_column = normalize_column_name(&request.join_column);
        if join_column.is_empty() {
            return Err(DatasetError::InvalidRequest("join column is required".to_string()));
        }

        let started = Instant::now();

        let (left, right) =
            futures::try_join!(self.get_file(request.left_id), self.get_file(request.right_id))?;
        let (left_bytes, right_bytes) =
            futures::try_join!(self.fetch_bytes(&left), self.fetch_bytes(&right))?;

        let how = request.join_type;
        let on = join_column.clone();
        let (left_format, right_format) = (left.format, right.format);

        let table = tokio::task::spawn_blocking(move || -> DatasetResult<Table> {
            let left = load_table(left_format, &left_bytes)?;
            let right = load_table(right_format, &right_bytes)?;
            join(&left, &right, &on, how)
        })
        .await
        .map_err(|e| DatasetError::Internal(format!("merge task failed: {e}")))??;

        let spec = MergeSpec {
            left_id: left.id,
            right_id: right.id,
            join_column,
            join_type: how,
        };
        let entry = self.cache.put(spec, table);

        metrics::counter!("merges.completed").increment(1);
        metrics::histogram!("merge.duration_seconds").record(started.elapsed().as_secs_f64());

        info!(
            cache_key = %entry.key,
            join_type = %how,
            rows = entry.table.num_rows(),
            columns = entry.table.num_columns(),
            "Merge result cached"
        );

        Ok(MergeSummary {
            cache_key: entry.key.clone(),
            join_column: entry.spec.join_column.clone(),
            join_type: how,
            row_count: entry.table.num_rows(),
            column_names: entry.table.column_names(),
            preview: entry.table.slice_json(0, self.limits.preview_rows),
            expires_at: entry.expires_at,
        })
    }

    /// One page (1-based) of a cached merge result
    pub async fn preview(
        &self,
        cache_key: &str,
        page: usize,
        page_size: usize,
    ) -> DatasetResult<PreviewPage> {
        if page == 0 {
            return Err(DatasetError::InvalidRequest("page starts at 1".to_string()));
        }
        if page_size == 0 || page_size > self.limits.max_page_size {
            return Err(DatasetError::InvalidRequest(format!(
                "page_size must be between 1 and {}",
                self.limits.max_page_size
            )));
        }

        let entry = self
            .cache
            .get(cache_key)
            .ok_or_else(|| DatasetError::CacheMiss(cache_key.to_string()))?;

        let total_rows = entry.table.num_rows();
        let offset = (page - 1).saturating_mul(page_size);

        debug!(cache_key = %cache_key, page, page_size, total_rows, "Serving merge preview");

        Ok(PreviewPage {
            cache_key: entry.key.clone(),
            page,
            page_size,
            total_rows,
            total_pages: total_rows.div_ceil(page_size),
            columns: entry.table.column_names(),
            rows: entry.table.slice_json(offset, page_size),
            expires_at: entry.expires_at,
        })
    }

    /// Persist a cached merge result as a new file. The cache entry is kept
    /// until it expires, so a commit can be repeated.
    #[instrument(skip(self))]
    pub async fn commit(&self, cache_key: &str, name: &str) -> DatasetResult<FileRecord> {
        let entry = self
            .cache
            .get(cache_key)
            .ok_or_else(|| DatasetError::CacheMiss(cache_key.to_string()))?;

        let (name, format) = commit_target(name)?;

        let table = Arc::clone(&entry.table);
        let bytes = tokio::task::spawn_blocking(move || format.codec().encode(&table))
            .await
            .map_err(|e| DatasetError::Internal(format!("encode task failed: {e}")))??;

        let spec = &entry.spec;
        let record = self
            .store(NewFile {
                name,
                format,
                bytes,
                uploaded_by: MERGE_UPLOADER.to_string(),
                description: format!(
                    "Merged dataset: {} join of {} and {} on '{}'",
                    spec.join_type, spec.left_id, spec.right_id, spec.join_column
                ),
                status: FileStatus::Merged,
            })
            .await?;

        metrics::counter!("merges.committed").increment(1);
        info!(cache_key = %cache_key, file_id = %record.id, "Merge result committed");

        Ok(record)
    }

    /// Remove a file's object and record. An object that is already gone is
    /// only a warning, so interrupted deletes can be retried.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> DatasetResult<()> {
        let record = self.get_file(id).await?;

        match self.objects.delete(&record.storage_key).await {
            Ok(true) => {}
            Ok(false) => warn!(
                file_id = %id,
                storage_key = %record.storage_key,
                "Object already missing, removing record anyway"
            ),
            Err(e) => return Err(DatasetError::write(e)),
        }

        if !self.metadata.delete(id).await.map_err(DatasetError::write)? {
            warn!(file_id = %id, "Record was removed concurrently");
        }

        metrics::counter!("datasets.deleted").increment(1);
        info!(file_id = %id, "File deleted");

        Ok(())
    }

    async fn fetch_bytes(&self, record: &FileRecord) -> DatasetResult<Vec<u8>> {
        self.objects
            .get(&record.storage_key)
            .await
            .map_err(DatasetError::read)?
            .ok_or_else(|| {
                DatasetError::StorageRead(format!(
                    "object '{}' for file {} is missing",
                    record.storage_key, record.id
                ))
            })
    }

    /// Write the object, then the record; undo the object write if the
    /// record cannot be inserted
    async fn store(&self, file: NewFile) -> DatasetResult<FileRecord> {
        let id = Uuid::new_v4();
        // Postgres keeps microseconds; match it so stored and returned records agree
        let created_at = Utc::now().trunc_subsecs(6);
        let storage_key = generate_storage_key(id, &file.name, created_at);
        let size_bytes = file.bytes.len() as i64;

        self.objects
            .put(&storage_key, file.bytes, file.format.content_type())
            .await
            .map_err(DatasetError::write)?;

        let record = FileRecord {
            id,
            name: file.name,
            format: file.format,
            storage_key,
            size_bytes,
            description: file.description,
            uploaded_by: file.uploaded_by,
            status: file.status,
            created_at,
        };

        if let Err(e) = self.metadata.insert(&record).await {
            match self.objects.delete(&record.storage_key).await {
                Ok(_) => warn!(
                    storage_key = %record.storage_key,
                    "Removed object after failed metadata insert"
                ),
                Err(cleanup) => error!(
                    storage_key = %record.storage_key,
                    error = %cleanup,
                    "Failed to remove object after failed metadata insert; object is orphaned"
                ),
            }
            return Err(DatasetError::write(e));
        }

        Ok(record)
    }
}

fn load_table(format: FileFormat, bytes: &[u8]) -> DatasetResult<Table> {
    format.codec().decode(bytes)?.normalize_column_names()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Final name and format for a committed merge result. Names without an
/// extension are saved as CSV.
fn commit_target(name: &str) -> DatasetResult<(String, FileFormat)> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DatasetError::InvalidRequest("name is required".to_string()));
    }

    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            let format: FileFormat = ext.parse()?;
            Ok((name.to_string(), format))
        }
        _ => Ok((format!("{name}.csv"), FileFormat::Csv)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CsvCodec, TabularCodec};
    use crate::metadata_store::MockMetadataStore;
    use crate::object_store::MockObjectStore;
    use crate::table::Value;
    use crate::testing::{test_service, InMemoryMetadataStore, InMemoryObjectStore};
    use std::time::Duration;

    const A_CSV: &str = "id,val\n1,10\n2,20\n3,30\n";
    const B_CSV: &str = "id,score\n2,200\n3,300\n4,400\n";

    fn upload_request(name: &str, content: &str) -> UploadRequest {
        UploadRequest {
            name: name.to_string(),
            bytes: content.as_bytes().to_vec(),
            uploaded_by: Some("analyst".to_string()),
            description: None,
        }
    }

    fn merge_request(left: &FileRecord, right: &FileRecord, column: &str, how: JoinType) -> MergeRequest {
        MergeRequest {
            left_id: left.id,
            right_id: right.id,
            join_column: column.to_string(),
            join_type: how,
        }
    }

    #[tokio::test]
    async fn test_upload_then_list() {
        let (service, _, objects) = test_service(Duration::from_secs(600));

        let record = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        assert_eq!(record.format, FileFormat::Csv);
        assert_eq!(record.status, FileStatus::Active);
        assert_eq!(record.uploaded_by, "analyst");
        assert_eq!(record.size_bytes, A_CSV.len() as i64);
        assert_eq!(objects.content_type(&record.storage_key).as_deref(), Some("text/csv"));

        let files = service.list_files().await.unwrap();
        assert_eq!(files, vec![record]);
    }

    #[tokio::test]
    async fn test_created_at_has_microsecond_precision() {
        let (service, _, _) = test_service(Duration::from_secs(600));

        for _ in 0..5 {
            let record = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
            assert_eq!(record.created_at.timestamp_subsec_nanos() % 1_000, 0);
            assert_eq!(record.created_at, record.created_at.trunc_subsecs(6));
        }
    }

    #[tokio::test]
    async fn test_upload_detects_xlsx() {
        let (service, _, _) = test_service(Duration::from_secs(600));

        let table = CsvCodec.decode(A_CSV.as_bytes()).unwrap();
        let bytes = FileFormat::Xlsx.codec().encode(&table).unwrap();

        let record = service
            .upload(UploadRequest {
                name: "A.xlsx".to_string(),
                bytes,
                uploaded_by: None,
                description: Some("  ".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(record.format, FileFormat::Xlsx);
        assert_eq!(record.uploaded_by, "anonymous");
        assert_eq!(record.description, "");
    }

    #[tokio::test]
    async fn test_upload_rejects_unsupported_and_empty_files() {
        let (service, metadata, objects) = test_service(Duration::from_secs(600));

        let err = service.upload(upload_request("notes.txt", "hello")).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");

        let err = service.upload(upload_request("A.csv", "")).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        assert!(metadata.is_empty());
        assert!(objects.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_in_creation_order() {
        let (service, _, _) = test_service(Duration::from_secs(600));

        let mut expected = Vec::new();
        for name in ["c.csv", "a.csv", "b.csv"] {
            expected.push(service.upload(upload_request(name, A_CSV)).await.unwrap().id);
        }

        let listed: Vec<Uuid> = service.list_files().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn test_merge_preview_commit_delete_scenario() {
        let (service, _, objects) = test_service(Duration::from_secs(600));

        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let b = service.upload(upload_request("B.csv", B_CSV)).await.unwrap();

        let summary = service
            .merge(merge_request(&a, &b, "id", JoinType::Inner))
            .await
            .unwrap();
        assert_eq!(summary.row_count, 2);
        assert_eq!(summary.column_names, vec!["id", "val", "score"]);

        let page = service.preview(&summary.cache_key, 1, 10).await.unwrap();
        assert_eq!(page.total_rows, 2);
        assert_eq!(page.total_pages, 1);
        assert_eq!(page.columns, vec!["id", "val", "score"]);
        assert_eq!(
            page.rows,
            vec![
                vec![serde_json::json!(2), serde_json::json!(20), serde_json::json!(200)],
                vec![serde_json::json!(3), serde_json::json!(30), serde_json::json!(300)],
            ]
        );

        let c = service.commit(&summary.cache_key, "C").await.unwrap();
        assert_eq!(c.name, "C.csv");
        assert_eq!(c.format, FileFormat::Csv);
        assert_eq!(c.status, FileStatus::Merged);
        assert_eq!(c.uploaded_by, "system");

        let committed = service.download(c.id).await.unwrap();
        assert_eq!(
            String::from_utf8(committed.bytes).unwrap(),
            "id,val,score\n2,20,200\n3,30,300\n"
        );

        service.delete(a.id).await.unwrap();
        let remaining: Vec<Uuid> = service.list_files().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec![b.id, c.id]);
        assert!(!objects.contains(&a.storage_key));
        assert_eq!(service.get_file(a.id).await.unwrap_err().code(), "RECORD_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_merge_is_deterministic() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let b = service.upload(upload_request("B.csv", B_CSV)).await.unwrap();

        let first = service.merge(merge_request(&a, &b, "id", JoinType::Outer)).await.unwrap();
        let second = service.merge(merge_request(&a, &b, " ID ", JoinType::Outer)).await.unwrap();
        assert_eq!(first.cache_key, second.cache_key);

        let other = service.merge(merge_request(&a, &b, "id", JoinType::Left)).await.unwrap();
        assert_ne!(first.cache_key, other.cache_key);
    }

    #[tokio::test]
    async fn test_preview_matches_independent_join() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let b = service.upload(upload_request("B.csv", B_CSV)).await.unwrap();

        let summary = service.merge(merge_request(&a, &b, "id", JoinType::Left)).await.unwrap();

        let expected = join(
            &CsvCodec.decode(A_CSV.as_bytes()).unwrap(),
            &CsvCodec.decode(B_CSV.as_bytes()).unwrap(),
            "id",
            JoinType::Left,
        )
        .unwrap();

        let page = service.preview(&summary.cache_key, 1, 2).await.unwrap();
        assert_eq!(page.total_rows, expected.num_rows());
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.rows, expected.slice_json(0, 2));
        // id 1 has no match in B
        assert_eq!(page.rows[0][2], serde_json::Value::Null);

        let last = service.preview(&summary.cache_key, 2, 2).await.unwrap();
        assert_eq!(last.rows, expected.slice_json(2, 2));
        assert_eq!(last.rows.len(), 1);

        let past_end = service.preview(&summary.cache_key, 5, 2).await.unwrap();
        assert!(past_end.rows.is_empty());
    }

    fn xlsx_upload(name: &str, csv: &str) -> UploadRequest {
        let table = CsvCodec.decode(csv.as_bytes()).unwrap();
        UploadRequest {
            name: name.to_string(),
            bytes: FileFormat::Xlsx.codec().encode(&table).unwrap(),
            uploaded_by: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn test_merge_xlsx_with_csv() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service
            .upload(xlsx_upload("A.xlsx", "Customer ID,val\n1,10\n2,20\n3,30\n"))
            .await
            .unwrap();
        let b = service
            .upload(upload_request("B.csv", "customer_id,score\n2,200\n3,300\n4,400\n"))
            .await
            .unwrap();
        assert_eq!(a.format, FileFormat::Xlsx);

        let summary = service
            .merge(merge_request(&a, &b, "customer id", JoinType::Inner))
            .await
            .unwrap();

        // Workbook numbers come back as integers and match the CSV keys
        assert_eq!(summary.column_names, vec!["customer_id", "val", "score"]);
        assert_eq!(
            summary.preview,
            vec![
                vec![serde_json::json!(2), serde_json::json!(20), serde_json::json!(200)],
                vec![serde_json::json!(3), serde_json::json!(30), serde_json::json!(300)],
            ]
        );
    }

    #[tokio::test]
    async fn test_merge_two_xlsx_files() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service
            .upload(xlsx_upload("A.xlsx", "id,ratio\n1,0.5\n2,1.5\n"))
            .await
            .unwrap();
        let b = service
            .upload(xlsx_upload("B.xlsx", "id,label\n2.0,two\n3.0,three\n"))
            .await
            .unwrap();

        let summary = service
            .merge(merge_request(&a, &b, "id", JoinType::Outer))
            .await
            .unwrap();

        assert_eq!(summary.row_count, 3);
        assert_eq!(summary.column_names, vec!["id", "ratio", "label"]);

        let page = service.preview(&summary.cache_key, 1, 10).await.unwrap();
        assert_eq!(
            page.rows,
            vec![
                vec![serde_json::json!(1), serde_json::json!(0.5), serde_json::Value::Null],
                vec![serde_json::json!(2), serde_json::json!(1.5), serde_json::json!("two")],
                vec![serde_json::json!(3), serde_json::Value::Null, serde_json::json!("three")],
            ]
        );
    }

    #[tokio::test]
    async fn test_merge_normalizes_column_names() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service
            .upload(upload_request("A.csv", "Customer ID,Total\n1,5\n"))
            .await
            .unwrap();
        let b = service
            .upload(upload_request("B.csv", "customer_id,Region\n1,north\n"))
            .await
            .unwrap();

        let summary = service
            .merge(merge_request(&a, &b, "Customer ID", JoinType::Inner))
            .await
            .unwrap();
        assert_eq!(summary.column_names, vec!["customer_id", "total", "region"]);
        assert_eq!(summary.preview, vec![vec![
            serde_json::json!(1),
            serde_json::json!(5),
            serde_json::json!("north"),
        ]]);
    }

    #[tokio::test]
    async fn test_merge_missing_column_creates_no_entry() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let b = service.upload(upload_request("B.csv", B_CSV)).await.unwrap();

        let err = service
            .merge(merge_request(&a, &b, "customer_id", JoinType::Inner))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JOIN_COLUMN_MISSING");
        assert!(service.cache.is_empty());
    }

    #[tokio::test]
    async fn test_merge_unknown_file() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();

        let err = service
            .merge(MergeRequest {
                left_id: a.id,
                right_id: Uuid::new_v4(),
                join_column: "id".to_string(),
                join_type: JoinType::Inner,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RECORD_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_merge_incompatible_keys() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let b = service
            .upload(upload_request("B.csv", "id,score\nx,1\ny,2\n"))
            .await
            .unwrap();

        let err = service
            .merge(merge_request(&a, &b, "id", JoinType::Inner))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INCOMPATIBLE_JOIN");
    }

    #[tokio::test]
    async fn test_merge_missing_object_is_read_error() {
        let (service, _, objects) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let b = service.upload(upload_request("B.csv", B_CSV)).await.unwrap();
        objects.remove(&b.storage_key);

        let err = service
            .merge(merge_request(&a, &b, "id", JoinType::Inner))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_READ_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_preview_after_ttl_is_cache_miss() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let b = service.upload(upload_request("B.csv", B_CSV)).await.unwrap();
        let summary = service.merge(merge_request(&a, &b, "id", JoinType::Inner)).await.unwrap();

        tokio::time::advance(Duration::from_secs(601)).await;

        let err = service.preview(&summary.cache_key, 1, 10).await.unwrap_err();
        assert_eq!(err.code(), "CACHE_MISS");
        let err = service.commit(&summary.cache_key, "late.csv").await.unwrap_err();
        assert_eq!(err.code(), "CACHE_MISS");
    }

    #[tokio::test]
    async fn test_preview_validates_paging() {
        let (service, _, _) = test_service(Duration::from_secs(600));

        assert_eq!(service.preview("k", 0, 10).await.unwrap_err().code(), "INVALID_REQUEST");
        assert_eq!(service.preview("k", 1, 0).await.unwrap_err().code(), "INVALID_REQUEST");
        assert_eq!(service.preview("k", 1, 1001).await.unwrap_err().code(), "INVALID_REQUEST");
        assert_eq!(service.preview("k", 1, 10).await.unwrap_err().code(), "CACHE_MISS");
    }

    #[tokio::test]
    async fn test_commit_is_repeatable_and_honours_format() {
        let (service, _, _) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let b = service.upload(upload_request("B.csv", B_CSV)).await.unwrap();
        let summary = service.merge(merge_request(&a, &b, "id", JoinType::Outer)).await.unwrap();

        let xlsx = service.commit(&summary.cache_key, "merged.xlsx").await.unwrap();
        assert_eq!(xlsx.format, FileFormat::Xlsx);

        let csv = service.commit(&summary.cache_key, "merged.csv").await.unwrap();
        assert_ne!(csv.id, xlsx.id);

        let err = service.commit(&summary.cache_key, "merged.json").await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");

        // The committed workbook decodes to the merged table
        let stored = service.download(xlsx.id).await.unwrap();
        let table = FileFormat::Xlsx.codec().decode(&stored.bytes).unwrap();
        assert_eq!(table.num_rows(), 4);
        assert_eq!(table.column("score").unwrap().values()[0], Value::Null);

        // Entry survives commits
        assert!(service.preview(&summary.cache_key, 1, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_commit_then_delete_round_trip() {
        let (service, _, objects) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let b = service.upload(upload_request("B.csv", B_CSV)).await.unwrap();
        let summary = service.merge(merge_request(&a, &b, "id", JoinType::Inner)).await.unwrap();

        let c = service.commit(&summary.cache_key, "C.csv").await.unwrap();
        assert!(service.list_files().await.unwrap().iter().any(|r| r.id == c.id));

        service.delete(c.id).await.unwrap();
        assert!(!service.list_files().await.unwrap().iter().any(|r| r.id == c.id));
        assert!(!objects.contains(&c.storage_key));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let (service, metadata, objects) = test_service(Duration::from_secs(600));
        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        objects.remove(&a.storage_key);

        service.delete(a.id).await.unwrap();
        assert!(metadata.is_empty());

        let err = service.delete(a.id).await.unwrap_err();
        assert_eq!(err.code(), "RECORD_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_failed_insert_removes_object() {
        let objects = Arc::new(InMemoryObjectStore::default());
        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_insert()
            .returning(|_| Err(anyhow::anyhow!("database unavailable")));

        let service = DatasetService::new(
            Arc::new(metadata),
            objects.clone(),
            Arc::new(MergeCache::new(Duration::from_secs(600))),
            ServiceLimits::default(),
        );

        let err = service.upload(upload_request("A.csv", A_CSV)).await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_WRITE_ERROR");
        assert!(err.to_string().contains("database unavailable"));
        assert!(objects.is_empty());
    }

    #[tokio::test]
    async fn test_failed_object_write_skips_metadata() {
        let mut objects = MockObjectStore::new();
        objects
            .expect_put()
            .returning(|_, _, _| Err(anyhow::anyhow!("bucket unreachable")));
        let metadata = Arc::new(InMemoryMetadataStore::default());

        let service = DatasetService::new(
            metadata.clone(),
            Arc::new(objects),
            Arc::new(MergeCache::new(Duration::from_secs(600))),
            ServiceLimits::default(),
        );

        let err = service.upload(upload_request("A.csv", A_CSV)).await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_WRITE_ERROR");
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_record_when_object_delete_fails() {
        let metadata = Arc::new(InMemoryMetadataStore::default());
        let mut objects = MockObjectStore::new();
        objects.expect_put().returning(|_, _, _| Ok(()));
        objects
            .expect_delete()
            .returning(|_| Err(anyhow::anyhow!("access denied")));

        let service = DatasetService::new(
            metadata.clone(),
            Arc::new(objects),
            Arc::new(MergeCache::new(Duration::from_secs(600))),
            ServiceLimits::default(),
        );

        let a = service.upload(upload_request("A.csv", A_CSV)).await.unwrap();
        let err = service.delete(a.id).await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_WRITE_ERROR");
        assert!(service.get_file(a.id).await.is_ok());
    }

    #[test]
    fn test_commit_target() {
        assert_eq!(commit_target("C").unwrap(), ("C.csv".to_string(), FileFormat::Csv));
        assert_eq!(
            commit_target(" out.XLSX ").unwrap(),
            ("out.XLSX".to_string(), FileFormat::Xlsx)
        );
        assert_eq!(commit_target(".hidden").unwrap().0, ".hidden.csv");
        assert!(commit_target("out.parquet").is_err());
        assert!(commit_target("  ").is_err());
    }
}
