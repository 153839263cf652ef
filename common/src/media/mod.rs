use std::path::Path;

use chrono::{DateTime, Utc};
use thiserror::Error;

use api::media::MediaCategory;

pub mod heif;
pub mod image;
pub mod video;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Per-file hard failure: stat or open did not succeed. The only
    /// variant that increments `failureCount` and drops the record (§4.1).
    #[error("unreadable file {path}: {source}")]
    UnreadableFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported format for {path:?}")]
    UnsupportedFormat { path: std::path::PathBuf },

    #[error("corrupt metadata in {path:?}: {reason}")]
    CorruptMetadata {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("native HEIF tool unavailable")]
    NativeToolUnavailable,
}

/// Everything an extractor contributes beyond what the executor already
/// knows from `stat` (path, size, mtime). All fields beyond `category` are
/// best-effort: a missing tag leaves the field `None`, never an error.
#[derive(Clone, Debug, Default)]
pub struct ExtractedMetadata {
    pub category: Option<MediaCategory>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub exif_timestamp: Option<DateTime<Utc>>,
    pub exif_timezone_offset: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens_model: Option<String>,
    pub exposure_time: Option<String>,
    pub aperture: Option<f64>,
    pub iso: Option<i64>,
    pub focal_length: Option<f64>,
    pub duration: Option<f64>,
    pub video_codec: Option<String>,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "tif", "tiff", "png", "webp"];
const HEIF_EXTENSIONS: &[&str] = &["heic", "heif", "heics", "heifs"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "m4v"];

fn extension_lower(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Dispatches to the right format reader by extension (case-insensitive),
/// with a magic-byte probe as the image tiebreaker (§4.1). Only
/// `ExtractError::UnreadableFile` at open time is a hard failure; every
/// other error kind is absorbed by the caller into a partial record.
pub async fn extract(path: &std::path::Path) -> Result<ExtractedMetadata, ExtractError> {
    let ext = extension_lower(path);

    if heif::is_heif(path) {
        return image::extract_heif(path).await;
    }

    match ext.as_deref() {
        Some(e) if IMAGE_EXTENSIONS.contains(&e) => image::extract_image(path).await,
        Some(e) if HEIF_EXTENSIONS.contains(&e) => image::extract_heif(path).await,
        Some(e) if VIDEO_EXTENSIONS.contains(&e) => video::extract_video(path).await,
        _ => {
            // fall back to a magic-byte probe; some files carry the wrong
            // extension, and the image tiebreaker applies here too.
            match sniff_magic(path).await {
                Some(MediaCategory::Image) => image::extract_image(path).await,
                Some(MediaCategory::Video) => video::extract_video(path).await,
                None => Err(ExtractError::UnsupportedFormat {
                    path: path.to_path_buf(),
                }),
            }
        }
    }
}

/// Extension-independent whitelist check used by the planner to decide
/// whether a walked path is in scope at all.
pub fn is_supported_extension(path: &Path) -> bool {
    match extension_lower(path) {
        Some(ext) => {
            IMAGE_EXTENSIONS.contains(&ext.as_str())
                || HEIF_EXTENSIONS.contains(&ext.as_str())
                || VIDEO_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

async fn sniff_magic(path: &Path) -> Option<MediaCategory> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = [0u8; 16];
    let n = file.read(&mut buf).await.ok()?;

    if n >= 4 && &buf[0..2] == b"\xff\xd8" {
        return Some(MediaCategory::Image);
    }

    if n >= 8 && &buf[0..8] == b"\x89PNG\r\n\x1a\n" {
        return Some(MediaCategory::Image);
    }

    if n >= 12 && &buf[0..4] == b"RIFF" && &buf[8..12] == b"WEBP" {
        return Some(MediaCategory::Image);
    }

    if n >= 8 && (&buf[4..8] == b"ftyp") {
        return Some(MediaCategory::Video);
    }

    if n >= 4 && &buf[0..4] == b"\x1aE\xdf\xa3" {
        return Some(MediaCategory::Video);
    }

    if n >= 12 && &buf[0..4] == b"RIFF" && &buf[8..12] == b"AVI " {
        return Some(MediaCategory::Video);
    }

    None
}
