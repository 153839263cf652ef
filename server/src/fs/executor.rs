use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use api::media::{MediaCategory, MediaRecord};
use api::scan::ScanPhase;
use chrono::{DateTime, Utc};
use common::db::PendingRecord;
use common::media::{extract, ExtractError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::db::adapter::CatalogAdapter;
use crate::fs::progress::ProgressReporter;

/// Soft per-file extraction budget (§5); a file that exceeds it is counted
/// as a failure rather than stalling the whole pool.
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);

enum Outcome {
    Success,
    Failure,
}

/// Consumes `toAdd ∪ toUpdate`, bounded by a semaphore sized to the
/// configured worker count (§4.5). Cancellation is checked between
/// dequeues: once set, no new items are dispatched, but items already
/// spawned run to completion and their staged writes are still committed.
#[instrument(skip_all, fields(count = items.len()))]
pub async fn process(
    items: Vec<PathBuf>,
    adapter: Arc<CatalogAdapter>,
    progress: Arc<ProgressReporter>,
    cancel: Arc<AtomicBool>,
    worker_count: usize,
) {
    let semaphore = Arc::new(Semaphore::new(worker_count));
    let mut tasks = JoinSet::new();

    for path in items {
        if cancel.load(Ordering::Relaxed) {
            debug!("scan cancelled, no further items will be dispatched");
            break;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let adapter = adapter.clone();

        tasks.spawn(async move {
            let _permit = permit;
            process_one(&path, &adapter).await
        });
    }

    while let Some(res) = tasks.join_next().await {
        let outcome = match res {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "extractor task panicked");
                Outcome::Failure
            }
        };

        progress
            .update(|p| match outcome {
                Outcome::Success => p.success_count += 1,
                Outcome::Failure => p.failure_count += 1,
            })
            .await;
    }

    if let Err(err) = adapter.flush().await {
        warn!(%err, "final batch flush failed after processing");
    }
}

async fn process_one(path: &Path, adapter: &CatalogAdapter) -> Outcome {
    let pathstr = path.to_string_lossy().into_owned();

    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) => {
            warn!(path = %pathstr, %err, "failed to stat file");
            return Outcome::Failure;
        }
    };

    let modify_time: DateTime<Utc> = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    let existing = adapter.find_by_path(&pathstr).await.ok().flatten();

    if let Some((uuid, record)) = &existing {
        if record.matches_stat(meta.len(), modify_time) {
            debug!(path = %pathstr, "fast-path skip: size and mtime unchanged");
            let stage_result = adapter
                .stage(PendingRecord::Touch(*uuid, Utc::now()))
                .await;

            return match stage_result {
                Ok(()) => Outcome::Success,
                Err(err) => {
                    warn!(path = %pathstr, %err, "failed to stage touch");
                    Outcome::Failure
                }
            };
        }
    }

    let create_time = meta
        .created()
        .or_else(|_| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    let extracted = match tokio::time::timeout(EXTRACT_TIMEOUT, extract(path)).await {
        Ok(Ok(metadata)) => Some(metadata),
        Ok(Err(ExtractError::UnreadableFile { .. })) => {
            warn!(path = %pathstr, "unreadable file, counted as failure");
            return Outcome::Failure;
        }
        Ok(Err(err)) => {
            // UnsupportedFormat / CorruptMetadata / NativeToolUnavailable are
            // partial successes: the record is still catalogued with the
            // affected fields left null (§4.1 error policy).
            debug!(path = %pathstr, %err, "extraction produced a partial record");
            None
        }
        Err(_) => {
            warn!(path = %pathstr, "extraction exceeded the soft timeout");
            return Outcome::Failure;
        }
    };

    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mime_type = mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_owned())
        .unwrap_or_else(|| "application/octet-stream".to_owned());

    let category = extracted
        .as_ref()
        .and_then(|m| m.category)
        .unwrap_or_else(|| {
            if mime_type.starts_with("video/") {
                MediaCategory::Video
            } else {
                MediaCategory::Image
            }
        });

    let record = MediaRecord {
        path: pathstr.clone(),
        file_name,
        size: meta.len(),
        mime_type,
        category,
        width: extracted.as_ref().and_then(|m| m.width),
        height: extracted.as_ref().and_then(|m| m.height),
        exif_timestamp: extracted.as_ref().and_then(|m| m.exif_timestamp),
        exif_timezone_offset: extracted.as_ref().and_then(|m| m.exif_timezone_offset.clone()),
        create_time,
        modify_time,
        last_scanned: Utc::now(),
        camera_make: extracted.as_ref().and_then(|m| m.camera_make.clone()),
        camera_model: extracted.as_ref().and_then(|m| m.camera_model.clone()),
        lens_model: extracted.as_ref().and_then(|m| m.lens_model.clone()),
        exposure_time: extracted.as_ref().and_then(|m| m.exposure_time.clone()),
        aperture: extracted.as_ref().and_then(|m| m.aperture),
        iso: extracted.as_ref().and_then(|m| m.iso),
        focal_length: extracted.as_ref().and_then(|m| m.focal_length),
        duration: extracted.as_ref().and_then(|m| m.duration),
        video_codec: extracted.as_ref().and_then(|m| m.video_codec.clone()),
        thumbnail_generated: false,
    };

    let pending = match &existing {
        Some((uuid, _)) => PendingRecord::Update(*uuid, record),
        None => PendingRecord::Insert(record),
    };

    match adapter.stage(pending).await {
        Ok(()) => Outcome::Success,
        Err(err) => {
            warn!(path = %pathstr, %err, "failed to stage record");
            Outcome::Failure
        }
    }
}

/// Delete phase (`deleting`): executed serially after processing
/// completes, checked against the cancellation flag before each batch.
#[instrument(skip_all, fields(count = to_delete.len()))]
pub async fn run_delete(
    to_delete: Vec<String>,
    adapter: &CatalogAdapter,
    progress: &ProgressReporter,
    cancel: &AtomicBool,
) {
    progress
        .update(|p| {
            p.phase = ScanPhase::Deleting;
            p.phase_message = "removing catalog entries for missing files".to_owned();
        })
        .await;

    if cancel.load(Ordering::Relaxed) || to_delete.is_empty() {
        return;
    }

    let failed = adapter.delete(to_delete, cancel).await;

    if failed > 0 {
        progress
            .update(|p| {
                p.message = Some(format!("{failed} catalog entries failed to delete"));
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use api::media::{MediaCategory, MediaRecord};
    use chrono::{DateTime, Utc};
    use common::db::fake::FakeBackend;

    use super::*;
    use crate::fs::test_support::spawn_fake_db;

    fn bare_record(path: &str, size: u64, modify_time: DateTime<Utc>) -> MediaRecord {
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
    async fn fast_path_skip_bumps_last_scanned_without_reextracting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"not really a jpeg").unwrap();

        let stat = tokio::fs::metadata(&path).await.unwrap();
        let modify_time = DateTime::<Utc>::from(stat.modified().unwrap());
        let old_last_scanned = modify_time - chrono::Duration::days(1);

        let backend = Arc::new(FakeBackend::new());
        let pathstr = path.to_string_lossy().into_owned();
        // the seeded record's last_scanned predates the fast-path touch so
        // the test can tell the touch actually happened
        let mut seeded = bare_record(&pathstr, stat.len(), modify_time);
        seeded.last_scanned = old_last_scanned;
        let uuid = backend.seed(seeded);

        let adapter = Arc::new(CatalogAdapter::new(spawn_fake_db(backend.clone()), 50));
        let progress = Arc::new(ProgressReporter::new());
        let cancel = Arc::new(AtomicBool::new(false));

        process(vec![path], adapter, progress.clone(), cancel, 2).await;

        let snapshot = progress.snapshot().await;
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.failure_count, 0);

        let (stored_uuid, stored) = backend.get(&pathstr).unwrap();
        assert_eq!(stored_uuid, uuid);
        assert!(stored.last_scanned > old_last_scanned);
        assert_eq!(stored.size, stat.len());
    }

    #[tokio::test]
    async fn unsupported_format_is_a_success_with_null_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mystery.bin");
        std::fs::write(&path, b"not a known container").unwrap();

        let backend = Arc::new(FakeBackend::new());
        let adapter = Arc::new(CatalogAdapter::new(spawn_fake_db(backend.clone()), 50));
        let progress = Arc::new(ProgressReporter::new());
        let cancel = Arc::new(AtomicBool::new(false));

        let pathstr = path.to_string_lossy().into_owned();

        process(vec![path], adapter, progress.clone(), cancel, 2).await;

        let snapshot = progress.snapshot().await;
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.failure_count, 0);

        let (_, stored) = backend.get(&pathstr).unwrap();
        assert_eq!(stored.width, None);
        assert_eq!(stored.camera_make, None);
    }

    #[tokio::test]
    async fn stat_failure_counts_as_failure_and_drops_the_item() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.jpg");

        let backend = Arc::new(FakeBackend::new());
        let adapter = Arc::new(CatalogAdapter::new(spawn_fake_db(backend.clone()), 50));
        let progress = Arc::new(ProgressReporter::new());
        let cancel = Arc::new(AtomicBool::new(false));

        process(vec![missing], adapter, progress.clone(), cancel, 2).await;

        let snapshot = progress.snapshot().await;
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(backend.len(), 0);
    }

    #[tokio::test]
    async fn cancelling_before_dispatch_skips_all_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();

        let backend = Arc::new(FakeBackend::new());
        let adapter = Arc::new(CatalogAdapter::new(spawn_fake_db(backend.clone()), 50));
        let progress = Arc::new(ProgressReporter::new());
        let cancel = Arc::new(AtomicBool::new(true));

        process(vec![path], adapter, progress.clone(), cancel, 2).await;

        let snapshot = progress.snapshot().await;
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(backend.len(), 0);
    }
}
