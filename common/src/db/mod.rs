use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use api::directory::Directory;
use api::media::{MediaRecord, MediaUuid};

pub mod mariadb;
pub use mariadb::MariaDbBackend;

#[cfg(feature = "testutil")]
pub mod fake;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// A transient failure (connection drop, deadlock, pool exhaustion).
    /// The caller (the catalog adapter) retries once with backoff before
    /// giving up on the batch.
    #[error("transient catalog failure: {0}")]
    Transient(String),

    /// Root path inaccessible, store unreachable after retries, or any
    /// other condition that should abort the whole scan.
    #[error("fatal catalog failure: {0}")]
    Fatal(String),
}

/// A staged write produced by the executor. `Touch` covers the fast-path
/// skip: bump `last_scanned` without re-running extraction.
#[derive(Clone, Debug)]
pub enum PendingRecord {
    Insert(MediaRecord),
    Update(MediaUuid, MediaRecord),
    Touch(MediaUuid, chrono::DateTime<chrono::Utc>),
}

/// The transactional key-value/relational persistence layer the core scan
/// pipeline diffs against and writes to. Deliberately narrow: no query,
/// filter, or auth surface lives here (those are external collaborators
/// per spec.md's scope).
#[async_trait]
pub trait CatalogBackend: Send + Sync + 'static {
    fn new(config: Arc<Config>) -> anyhow::Result<Self>
    where
        Self: Sized;

    async fn find_by_path(
        &self,
        path: &str,
    ) -> Result<Option<(MediaUuid, MediaRecord)>, CatalogError>;

    async fn find_all(&self) -> Result<Vec<(MediaUuid, MediaRecord)>, CatalogError>;

    /// Every path currently catalogued, used by the planner to compute
    /// `toDelete = catalog.allPaths() - filesystemPaths`.
    async fn all_paths(&self) -> Result<HashSet<String>, CatalogError>;

    /// Commits a batch in a single transaction. Callers (the catalog
    /// adapter) are responsible for retry/backoff on `CatalogError::Transient`.
    async fn save_all(&self, batch: Vec<PendingRecord>) -> Result<(), CatalogError>;

    /// Deletes catalog rows by path, in one transaction.
    async fn delete(&self, paths: Vec<String>) -> Result<(), CatalogError>;

    async fn count(&self) -> Result<i64, CatalogError>;

    /// Best-effort, lazy directory index upsert; failures here never affect
    /// scan success (§9 open question: directories.file_count is
    /// maintained lazily, never an invariant).
    async fn upsert_directory(&self, dir: Directory) -> Result<(), CatalogError>;
}
