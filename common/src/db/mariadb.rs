use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mysql_async::{from_row_opt, params, prelude::*, FromRowError, Pool, Row};
use tracing::{debug, instrument, Level};

use api::directory::Directory;
use api::media::{MediaCategory, MediaRecord, MediaUuid};

use crate::config::Config;
use crate::db::{CatalogBackend, CatalogError, PendingRecord};

/// MariaDB/MySQL-backed catalog. As in the teacher's own `MariaDBState`,
/// we roll a thin manual layer over `mysql_async` rather than an ORM, so
/// the SQL driving the scan invariants is visible in one place.
///
/// Schema (logical, matches spec.md §6):
///
/// ```sql
/// CREATE TABLE media_files (
///     media_uuid BIGINT UNSIGNED PRIMARY KEY,
///     path VARCHAR(4096) NOT NULL UNIQUE,
///     file_name VARCHAR(1024) NOT NULL,
///     size BIGINT UNSIGNED NOT NULL,
///     mime_type VARCHAR(128) NOT NULL,
///     category VARCHAR(16) NOT NULL,
///     width INT UNSIGNED NULL,
///     height INT UNSIGNED NULL,
///     exif_timestamp BIGINT NULL,
///     exif_timezone_offset VARCHAR(8) NULL,
///     create_time BIGINT NOT NULL,
///     modify_time BIGINT NOT NULL,
///     last_scanned BIGINT NOT NULL,
///     camera_make VARCHAR(128) NULL,
///     camera_model VARCHAR(128) NULL,
///     lens_model VARCHAR(128) NULL,
///     exposure_time VARCHAR(32) NULL,
///     aperture DOUBLE NULL,
///     iso BIGINT NULL,
///     focal_length DOUBLE NULL,
///     duration DOUBLE NULL,
///     video_codec VARCHAR(32) NULL,
///     thumbnail_generated BOOLEAN NOT NULL DEFAULT FALSE
/// );
///
/// CREATE TABLE directories (
///     dir_uuid BIGINT UNSIGNED PRIMARY KEY,
///     path VARCHAR(4096) NOT NULL UNIQUE,
///     parent_id BIGINT UNSIGNED NULL,
///     file_count BIGINT NOT NULL,
///     last_modified BIGINT NOT NULL
/// );
/// ```
pub struct MariaDbBackend {
    pool: Pool,
}

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

type MediaRow = (
    MediaUuid,
    String,
    String,
    u64,
    String,
    String,
    Option<u32>,
    Option<u32>,
    Option<i64>,
    Option<String>,
    i64,
    i64,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<i64>,
    Option<f64>,
    Option<f64>,
    Option<String>,
    bool,
);

fn row_to_record(row: MediaRow) -> anyhow::Result<(MediaUuid, MediaRecord)> {
    let category = MediaCategory::from_str(&row.5)?;

    Ok((
        row.0,
        MediaRecord {
            path: row.1,
            file_name: row.2,
            size: row.3,
            mime_type: row.4,
            category,
            width: row.6,
            height: row.7,
            exif_timestamp: row.8.map(from_millis),
            exif_timezone_offset: row.9,
            create_time: from_millis(row.10),
            modify_time: from_millis(row.11),
            last_scanned: from_millis(row.12),
            camera_make: row.13,
            camera_model: row.14,
            lens_model: row.15,
            exposure_time: row.16,
            aperture: row.17,
            iso: row.18,
            focal_length: row.19,
            duration: row.20,
            video_codec: row.21,
            thumbnail_generated: row.22,
        },
    ))
}

const MEDIA_COLUMNS: &str = r"media_uuid, path, file_name, size, mime_type, category,
    width, height, exif_timestamp, exif_timezone_offset, create_time, modify_time,
    last_scanned, camera_make, camera_model, lens_model, exposure_time, aperture,
    iso, focal_length, duration, video_codec, thumbnail_generated";

impl MariaDbBackend {
    async fn insert_one(
        conn: &mut mysql_async::Conn,
        media: &MediaRecord,
    ) -> Result<(), CatalogError> {
        let q = format!(
            r"INSERT INTO media_files ({MEDIA_COLUMNS})
            VALUES (
                UUID_SHORT(), :path, :file_name, :size, :mime_type, :category,
                :width, :height, :exif_timestamp, :exif_timezone_offset, :create_time,
                :modify_time, :last_scanned, :camera_make, :camera_model, :lens_model,
                :exposure_time, :aperture, :iso, :focal_length, :duration, :video_codec,
                :thumbnail_generated
            )"
        );

        q.with(params! {
            "path" => media.path.clone(),
            "file_name" => media.file_name.clone(),
            "size" => media.size,
            "mime_type" => media.mime_type.clone(),
            "category" => media.category.as_str(),
            "width" => media.width,
            "height" => media.height,
            "exif_timestamp" => media.exif_timestamp.map(millis),
            "exif_timezone_offset" => media.exif_timezone_offset.clone(),
            "create_time" => millis(media.create_time),
            "modify_time" => millis(media.modify_time),
            "last_scanned" => millis(media.last_scanned),
            "camera_make" => media.camera_make.clone(),
            "camera_model" => media.camera_model.clone(),
            "lens_model" => media.lens_model.clone(),
            "exposure_time" => media.exposure_time.clone(),
            "aperture" => media.aperture,
            "iso" => media.iso,
            "focal_length" => media.focal_length,
            "duration" => media.duration,
            "video_codec" => media.video_codec.clone(),
            "thumbnail_generated" => media.thumbnail_generated,
        })
        .run(conn)
        .await
        .map_err(|err| CatalogError::Transient(err.to_string()))?;

        Ok(())
    }

    async fn update_one(
        conn: &mut mysql_async::Conn,
        media_uuid: MediaUuid,
        media: &MediaRecord,
    ) -> Result<(), CatalogError> {
        r"UPDATE media_files SET
            size = :size, mime_type = :mime_type, category = :category,
            width = :width, height = :height, exif_timestamp = :exif_timestamp,
            exif_timezone_offset = :exif_timezone_offset, modify_time = :modify_time,
            last_scanned = :last_scanned, camera_make = :camera_make,
            camera_model = :camera_model, lens_model = :lens_model,
            exposure_time = :exposure_time, aperture = :aperture, iso = :iso,
            focal_length = :focal_length, duration = :duration, video_codec = :video_codec
        WHERE media_uuid = :media_uuid"
            .with(params! {
                "media_uuid" => media_uuid,
                "size" => media.size,
                "mime_type" => media.mime_type.clone(),
                "category" => media.category.as_str(),
                "width" => media.width,
                "height" => media.height,
                "exif_timestamp" => media.exif_timestamp.map(millis),
                "exif_timezone_offset" => media.exif_timezone_offset.clone(),
                "modify_time" => millis(media.modify_time),
                "last_scanned" => millis(media.last_scanned),
                "camera_make" => media.camera_make.clone(),
                "camera_model" => media.camera_model.clone(),
                "lens_model" => media.lens_model.clone(),
                "exposure_time" => media.exposure_time.clone(),
                "aperture" => media.aperture,
                "iso" => media.iso,
                "focal_length" => media.focal_length,
                "duration" => media.duration,
                "video_codec" => media.video_codec.clone(),
            })
            .run(conn)
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        Ok(())
    }

    async fn touch_one(
        conn: &mut mysql_async::Conn,
        media_uuid: MediaUuid,
        last_scanned: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        r"UPDATE media_files SET last_scanned = :last_scanned WHERE media_uuid = :media_uuid"
            .with(params! {
                "last_scanned" => millis(last_scanned),
                "media_uuid" => media_uuid,
            })
            .run(conn)
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl CatalogBackend for MariaDbBackend {
    fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        Ok(MariaDbBackend {
            pool: Pool::new(config.db_path.as_str()),
        })
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn find_by_path(
        &self,
        path: &str,
    ) -> Result<Option<(MediaUuid, MediaRecord)>, CatalogError> {
        let conn = self
            .pool
            .get_conn()
            .await
            .map_err(|err| CatalogError::Fatal(err.to_string()))?;

        let mut rows = format!(r"SELECT {MEDIA_COLUMNS} FROM media_files WHERE path = :path")
            .with(params! { "path" => path })
            .run(conn)
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?
            .collect::<Row>()
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        let row = match rows.pop() {
            Some(row) => row,
            None => return Ok(None),
        };

        let data = from_row_opt::<MediaRow>(row)
            .map_err(|err: FromRowError| CatalogError::Fatal(err.to_string()))?;

        let result = row_to_record(data).map_err(|err| CatalogError::Fatal(err.to_string()))?;

        Ok(Some(result))
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn find_all(&self) -> Result<Vec<(MediaUuid, MediaRecord)>, CatalogError> {
        let conn = self
            .pool
            .get_conn()
            .await
            .map_err(|err| CatalogError::Fatal(err.to_string()))?;

        let rows = format!(r"SELECT {MEDIA_COLUMNS} FROM media_files")
            .with(params::Params::Empty)
            .run(conn)
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?
            .collect::<Row>()
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let data = from_row_opt::<MediaRow>(row)
                    .map_err(|err: FromRowError| CatalogError::Fatal(err.to_string()))?;
                row_to_record(data).map_err(|err| CatalogError::Fatal(err.to_string()))
            })
            .collect()
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn all_paths(&self) -> Result<HashSet<String>, CatalogError> {
        let conn = self
            .pool
            .get_conn()
            .await
            .map_err(|err| CatalogError::Fatal(err.to_string()))?;

        let rows = r"SELECT path FROM media_files"
            .with(params::Params::Empty)
            .run(conn)
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?
            .collect::<Row>()
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        rows.into_iter()
            .map(|row| {
                from_row_opt::<String>(row).map_err(|err| CatalogError::Fatal(err.to_string()))
            })
            .collect()
    }

    #[instrument(level = Level::DEBUG, skip(self, batch))]
    async fn save_all(&self, batch: Vec<PendingRecord>) -> Result<(), CatalogError> {
        debug!({ batch_len = batch.len() }, "committing catalog batch");

        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|err| CatalogError::Fatal(err.to_string()))?;

        // a single transaction per batch gives the "atomic batched
        // persistence" guarantee the planner/executor rely on.
        let mut tx = conn
            .start_transaction(mysql_async::TxOpts::default())
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        for item in &batch {
            match item {
                PendingRecord::Insert(media) => Self::insert_one(&mut tx, media).await?,
                PendingRecord::Update(uuid, media) => {
                    Self::update_one(&mut tx, *uuid, media).await?
                }
                PendingRecord::Touch(uuid, last_scanned) => {
                    Self::touch_one(&mut tx, *uuid, *last_scanned).await?
                }
            }
        }

        tx.commit()
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn delete(&self, paths: Vec<String>) -> Result<(), CatalogError> {
        if paths.is_empty() {
            return Ok(());
        }

        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|err| CatalogError::Fatal(err.to_string()))?;

        let mut tx = conn
            .start_transaction(mysql_async::TxOpts::default())
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        for path in &paths {
            r"DELETE FROM media_files WHERE path = :path"
                .with(params! { "path" => path.clone() })
                .run(&mut tx)
                .await
                .map_err(|err| CatalogError::Transient(err.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn count(&self) -> Result<i64, CatalogError> {
        let conn = self
            .pool
            .get_conn()
            .await
            .map_err(|err| CatalogError::Fatal(err.to_string()))?;

        let mut rows = r"SELECT COUNT(*) FROM media_files"
            .with(params::Params::Empty)
            .run(conn)
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?
            .collect::<Row>()
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        let row = rows
            .pop()
            .ok_or_else(|| CatalogError::Fatal("COUNT(*) returned no rows".to_owned()))?;

        from_row_opt::<i64>(row).map_err(|err| CatalogError::Fatal(err.to_string()))
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn upsert_directory(&self, dir: Directory) -> Result<(), CatalogError> {
        let conn = self
            .pool
            .get_conn()
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        r"INSERT INTO directories (dir_uuid, path, parent_id, file_count, last_modified)
        VALUES (UUID_SHORT(), :path, :parent_id, :file_count, :last_modified)
        ON DUPLICATE KEY UPDATE
            file_count = :file_count,
            last_modified = :last_modified"
            .with(params! {
                "path" => dir.path,
                "parent_id" => dir.parent_id,
                "file_count" => dir.file_count,
                "last_modified" => millis(dir.last_modified),
            })
            .run(conn)
            .await
            .map_err(|err| CatalogError::Transient(err.to_string()))?;

        Ok(())
    }
}
