use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use api::directory::Directory;
use api::media::{MediaRecord, MediaUuid};

use crate::config::Config;
use crate::db::{CatalogBackend, CatalogError, PendingRecord};

/// An in-memory stand-in for a real catalog store, used by planner/executor
/// tests that have no business standing up a MariaDB instance. Gated behind
/// the `testutil` feature so it never ships in a release build.
pub struct FakeBackend {
    records: Mutex<HashMap<String, (MediaUuid, MediaRecord)>>,
    next_uuid: Mutex<MediaUuid>,
    /// Number of remaining `save_all` calls that should report a transient
    /// failure, used to exercise the catalog adapter's retry/backoff path.
    fail_save_all: Mutex<usize>,
    directories: Mutex<HashMap<String, Directory>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        FakeBackend {
            records: Mutex::new(HashMap::new()),
            next_uuid: Mutex::new(1),
            fail_save_all: Mutex::new(0),
            directories: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-populates the store, as if a prior scan had already catalogued
    /// `record`. Returns the assigned id.
    pub fn seed(&self, record: MediaRecord) -> MediaUuid {
        let mut next = self.next_uuid.lock().unwrap();
        let uuid = *next;
        *next += 1;
        self.records
            .lock()
            .unwrap()
            .insert(record.path.clone(), (uuid, record));
        uuid
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn get(&self, path: &str) -> Option<(MediaUuid, MediaRecord)> {
        self.records.lock().unwrap().get(path).cloned()
    }

    /// The next `n` calls to `save_all` report `CatalogError::Transient`
    /// instead of committing.
    pub fn fail_next_saves(&self, n: usize) {
        *self.fail_save_all.lock().unwrap() = n;
    }

    pub fn directory(&self, path: &str) -> Option<Directory> {
        self.directories.lock().unwrap().get(path).cloned()
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogBackend for FakeBackend {
    fn new(_config: Arc<Config>) -> anyhow::Result<Self> {
        Ok(FakeBackend::new())
    }

    async fn find_by_path(
        &self,
        path: &str,
    ) -> Result<Option<(MediaUuid, MediaRecord)>, CatalogError> {
        Ok(self.records.lock().unwrap().get(path).cloned())
    }

    async fn find_all(&self) -> Result<Vec<(MediaUuid, MediaRecord)>, CatalogError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn all_paths(&self) -> Result<HashSet<String>, CatalogError> {
        Ok(self.records.lock().unwrap().keys().cloned().collect())
    }

    async fn save_all(&self, batch: Vec<PendingRecord>) -> Result<(), CatalogError> {
        {
            let mut fail_remaining = self.fail_save_all.lock().unwrap();
            if *fail_remaining > 0 {
                *fail_remaining -= 1;
                return Err(CatalogError::Transient(
                    "fake backend instructed to fail".to_owned(),
                ));
            }
        }

        let mut records = self.records.lock().unwrap();
        let mut next = self.next_uuid.lock().unwrap();

        for item in batch {
            match item {
                PendingRecord::Insert(media) => {
                    let uuid = *next;
                    *next += 1;
                    records.insert(media.path.clone(), (uuid, media));
                }
                PendingRecord::Update(uuid, media) => {
                    records.insert(media.path.clone(), (uuid, media));
                }
                PendingRecord::Touch(uuid, last_scanned) => {
                    if let Some((_, media)) = records.values_mut().find(|(id, _)| *id == uuid) {
                        media.last_scanned = last_scanned;
                    }
                }
            }
        }

        Ok(())
    }

    async fn delete(&self, paths: Vec<String>) -> Result<(), CatalogError> {
        let mut records = self.records.lock().unwrap();
        for path in paths {
            records.remove(&path);
        }
        Ok(())
    }

    async fn count(&self) -> Result<i64, CatalogError> {
        Ok(self.records.lock().unwrap().len() as i64)
    }

    async fn upsert_directory(&self, dir: Directory) -> Result<(), CatalogError> {
        self.directories.lock().unwrap().insert(dir.path.clone(), dir);
        Ok(())
    }
}
