use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use api::directory::Directory;
use api::scan::ScanPhase;
use chrono::{DateTime, Utc};
use common::media::is_supported_extension;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::db::adapter::CatalogAdapter;
use crate::fs::progress::ProgressReporter;

/// The three disjoint sets a scan diffs the filesystem against the
/// catalog into (§4.4). `to_update` is every extant path already in the
/// catalog, whether or not its stat matches what's stored — the executor
/// makes the final fast-path-skip-vs-reextract call per item against a
/// freshly read stat, since that's the only point with both values in
/// hand at once.
#[derive(Debug, Default)]
pub struct Plan {
    pub to_add: Vec<PathBuf>,
    pub to_update: Vec<PathBuf>,
    pub to_delete: Vec<String>,
}

/// Walks `root` breadth-first-equivalent (depth-first in this
/// implementation — nothing downstream depends on traversal order, only
/// on phase sequencing), then classifies every matching path against the
/// catalog adapter. Symlinked directories are never descended
/// (`follow_links(false)`); symlinked files are resolved once and deduped
/// by canonical path.
#[instrument(skip_all)]
pub async fn plan(
    root: &Path,
    adapter: &CatalogAdapter,
    progress: &ProgressReporter,
    cancel: &AtomicBool,
) -> anyhow::Result<Plan> {
    progress
        .update(|p| {
            p.phase = ScanPhase::Collecting;
            p.phase_message = format!("walking {}", root.display());
        })
        .await;

    let mut seen = HashSet::new();
    let mut collected = Vec::new();

    // Directory index (§3): coarse, lazy, best-effort — counted alongside
    // the same walk rather than a second pass over the tree.
    let mut dir_file_counts: HashMap<PathBuf, i64> = HashMap::new();
    let mut dir_last_modified: HashMap<PathBuf, DateTime<Utc>> = HashMap::new();

    for entry in WalkDir::new(root).follow_links(false) {
        if cancel.load(Ordering::Relaxed) {
            debug!("scan cancelled during collecting phase");
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "failed to read a directory entry during collecting");
                continue;
            }
        };

        if entry.file_type().is_dir() {
            progress
                .update(|p| {
                    p.phase_message = format!("walking {}", entry.path().display());
                })
                .await;

            dir_file_counts.entry(entry.path().to_path_buf()).or_insert(0);
            if let Ok(meta) = entry.metadata() {
                if let Ok(modified) = meta.modified() {
                    dir_last_modified.insert(entry.path().to_path_buf(), DateTime::<Utc>::from(modified));
                }
            }
            continue;
        }

        if !entry.file_type().is_file() {
            // symlinks to files pass through here after resolution; anything
            // else (fifo, socket, ...) is out of scope
            continue;
        }

        if !is_supported_extension(entry.path()) {
            continue;
        }

        if let Some(parent) = entry.path().parent() {
            *dir_file_counts.entry(parent.to_path_buf()).or_insert(0) += 1;
        }

        let canonical = match tokio::fs::canonicalize(entry.path()).await {
            Ok(path) => path,
            Err(err) => {
                warn!(path = %entry.path().display(), %err, "failed to canonicalize path");
                continue;
            }
        };

        if !seen.insert(canonical.clone()) {
            continue;
        }

        collected.push(canonical);
    }

    // Fire-and-forget, best-effort (§9 open question: lazy, never an
    // invariant); a failure here must never affect scan success.
    for (path, file_count) in &dir_file_counts {
        let last_modified = dir_last_modified.get(path).copied().unwrap_or_else(Utc::now);

        adapter
            .upsert_directory(Directory {
                path: path.to_string_lossy().into_owned(),
                parent_id: None,
                file_count: *file_count,
                last_modified,
            })
            .await;
    }

    progress
        .update(|p| {
            p.phase = ScanPhase::Counting;
            p.phase_message = "classifying collected files".to_owned();
        })
        .await;

    let mut plan = Plan::default();
    let mut filesystem_paths = HashSet::with_capacity(collected.len());

    for path in collected {
        if cancel.load(Ordering::Relaxed) {
            debug!("scan cancelled during counting phase");
            break;
        }

        let pathstr = path.to_string_lossy().into_owned();
        filesystem_paths.insert(pathstr.clone());

        match adapter.find_by_path(&pathstr).await {
            Ok(Some(_)) => plan.to_update.push(path),
            Ok(None) => plan.to_add.push(path),
            Err(err) => {
                warn!(path = %pathstr, %err, "failed to classify path against catalog, treating as add");
                plan.to_add.push(path);
            }
        }
    }

    let catalog_paths = adapter.all_paths().await.unwrap_or_default();
    plan.to_delete = catalog_paths
        .difference(&filesystem_paths)
        .cloned()
        .collect();

    // single atomic snapshot carries the new counts across the
    // counting -> processing transition (§4.4.3)
    let total = (plan.to_add.len() + plan.to_update.len()) as i64;
    progress
        .update(|p| {
            p.files_to_add = plan.to_add.len() as i64;
            p.files_to_update = plan.to_update.len() as i64;
            p.files_to_delete = plan.to_delete.len() as i64;
            p.total_files = total;
            p.phase = ScanPhase::Processing;
            p.phase_message = "processing files".to_owned();
        })
        .await;

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use api::media::{MediaCategory, MediaRecord};
    use chrono::Utc;
    use common::db::fake::FakeBackend;

    use super::*;
    use crate::db::adapter::CatalogAdapter;
    use crate::fs::test_support::spawn_fake_db;

    fn bare_record(path: &str, size: u64, modify_time: chrono::DateTime<Utc>) -> MediaRecord {
        MediaRecord {
            path: path.to_owned(),
            file_name: "unused".to_owned(),
            size,
            mime_type: "image/jpeg".to_owned(),
            category: MediaCategory::Image,
            width: None,
            height: None,
            exif_timestamp: None,
            exif_timezone_offset: None,
            create_time: modify_time,
            modify_time,
            last_scanned: modify_time,
            camera_make: None,
            camera_model: None,
            lens_model: None,
            exposure_time: None,
            aperture: None,
            iso: None,
            focal_length: None,
            duration: None,
            video_codec: None,
            thumbnail_generated: false,
        }
    }

    #[tokio::test]
    async fn classifies_add_update_and_delete() {
        let dir = tempfile::tempdir().unwrap();

        let fresh_path = dir.path().join("fresh.jpg");
        std::fs::write(&fresh_path, b"new file").unwrap();

        let stale_path = dir.path().join("stale.jpg");
        std::fs::write(&stale_path, b"changed contents").unwrap();

        // filtered out by extension, must not appear in any plan bucket
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

        let backend = Arc::new(FakeBackend::new());

        // already-catalogued but now stale (size/mtime no longer match disk)
        let stale_canonical = tokio::fs::canonicalize(&stale_path).await.unwrap();
        backend.seed(bare_record(
            &stale_canonical.to_string_lossy(),
            1,
            Utc::now() - chrono::Duration::days(1),
        ));

        // catalogued but no longer present on disk at all
        backend.seed(bare_record(
            &dir.path().join("gone.jpg").to_string_lossy(),
            1,
            Utc::now(),
        ));

        let adapter = CatalogAdapter::new(spawn_fake_db(backend), 50);
        let progress = ProgressReporter::new();
        let cancel = AtomicBool::new(false);

        let plan = plan(dir.path(), &adapter, &progress, &cancel).await.unwrap();

        assert_eq!(plan.to_add.len(), 1);
        assert_eq!(plan.to_add[0], tokio::fs::canonicalize(&fresh_path).await.unwrap());

        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0], stale_canonical);

        assert_eq!(plan.to_delete.len(), 1);
        assert!(plan.to_delete[0].ends_with("gone.jpg"));

        let snapshot = progress.snapshot().await;
        assert_eq!(snapshot.files_to_add, 1);
        assert_eq!(snapshot.files_to_update, 1);
        assert_eq!(snapshot.files_to_delete, 1);
        assert_eq!(snapshot.total_files, 2);
        assert_eq!(snapshot.phase, ScanPhase::Processing);
    }

    #[tokio::test]
    async fn symlinked_directories_are_not_descended() {
        let dir = tempfile::tempdir().unwrap();
        let real_subdir = dir.path().join("real");
        std::fs::create_dir(&real_subdir).unwrap();
        std::fs::write(real_subdir.join("a.jpg"), b"hi").unwrap();

        #[cfg(unix)]
        {
            let link = dir.path().join("link");
            std::os::unix::fs::symlink(&real_subdir, &link).unwrap();
        }

        let backend = Arc::new(FakeBackend::new());
        let adapter = CatalogAdapter::new(spawn_fake_db(backend), 50);
        let progress = ProgressReporter::new();
        let cancel = AtomicBool::new(false);

        let plan = plan(dir.path(), &adapter, &progress, &cancel).await.unwrap();

        // the real file is found once via "real/a.jpg"; the symlinked
        // directory is never descended a second time into the same file.
        assert_eq!(plan.to_add.len(), 1);
    }

    #[tokio::test]
    async fn walk_upserts_a_directory_index_entry_with_its_file_count() {
        let dir = tempfile::tempdir().unwrap();
        let subdir = dir.path().join("photos");
        std::fs::create_dir(&subdir).unwrap();
        std::fs::write(subdir.join("a.jpg"), b"one").unwrap();
        std::fs::write(subdir.join("b.jpg"), b"two").unwrap();
        std::fs::write(subdir.join("notes.txt"), b"ignored").unwrap();

        let backend = Arc::new(FakeBackend::new());
        let adapter = CatalogAdapter::new(spawn_fake_db(backend.clone()), 50);
        let progress = ProgressReporter::new();
        let cancel = AtomicBool::new(false);

        plan(dir.path(), &adapter, &progress, &cancel).await.unwrap();

        let entry = backend
            .directory(&subdir.to_string_lossy())
            .expect("directory index entry should have been upserted during the walk");
        assert_eq!(entry.file_count, 2, "only whitelisted extensions count");
    }
}
