//! Dataset Service
//!
//! Stores tabular datasets (CSV and XLSX), joins pairs of them on a key column,
//! and lets callers page through and persist the joined result.
//!
//! ## Features
//!
//! - **Uploads**: files are validated, written to S3 and indexed in PostgreSQL
//! - **Merges**: inner, left, right and outer joins on a named column, with
//!   normalised column names and `_x`/`_y` suffixes for overlapping columns
//! - **Merge Cache**: results live in memory for a configurable TTL under a
//!   deterministic key, so repeated merges and pagination are cheap
//! - **Commit**: a cached result can be saved as a new CSV or XLSX file
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API ──▶ DatasetService ──┬──▶ MetadataStore (PostgreSQL)
//!                                 ├──▶ ObjectStore   (S3)
//!                                 ├──▶ Codecs        (CSV / XLSX)
//!                                 ├──▶ Join
//!                                 └──▶ MergeCache    (in-memory, TTL)
//! ```

pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod join;
pub mod merge_cache;
pub mod metadata_store;
pub mod object_store;
pub mod service;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{create_router, start_api_server, AppState};
pub use codec::{FileFormat, TabularCodec};
pub use config::Config;
pub use error::{DatasetError, DatasetResult};
pub use join::{join, JoinType};
pub use merge_cache::{MergeCache, MergeEntry, MergeSpec};
pub use metadata_store::{FileRecord, FileStatus, MetadataStore, PgMetadataStore};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use service::{DatasetService, MergeRequest, MergeSummary, PreviewPage, ServiceLimits, UploadRequest};
pub use table::{Column, DataType, Table, Value};
