use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque catalog identity, assigned by the store at first insertion.
pub type MediaUuid = i64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MediaCategory {
    Image,
    Video,
}

impl MediaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Image => "image",
            MediaCategory::Video => "video",
        }
    }
}

impl std::str::FromStr for MediaCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaCategory::Image),
            "video" => Ok(MediaCategory::Video),
            other => Err(anyhow::Error::msg(format!(
                "unknown media category '{other}'"
            ))),
        }
    }
}

/// The catalog entity. `path` is the unique key; `MediaUuid` identity is
/// assigned by the catalog adapter, not carried on the value itself, so a
/// freshly-extracted record and a stored record use the same shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaRecord {
    pub path: String,
    pub file_name: String,
    pub size: u64,
    pub mime_type: String,
    pub category: MediaCategory,

    pub width: Option<u32>,
    pub height: Option<u32>,

    pub exif_timestamp: Option<DateTime<Utc>>,
    pub exif_timezone_offset: Option<String>,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub last_scanned: DateTime<Utc>,

    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens_model: Option<String>,
    pub exposure_time: Option<String>,
    pub aperture: Option<f64>,
    pub iso: Option<i64>,
    pub focal_length: Option<f64>,

    pub duration: Option<f64>,
    pub video_codec: Option<String>,

    pub thumbnail_generated: bool,
}

impl MediaRecord {
    /// Fast-path skip check: a record is up to date iff size and mtime
    /// match what's on disk (invariant 5 in the data model). Compared at
    /// millisecond precision, since that's all the catalog backend
    /// persists (`timestamp_millis()`/`from_millis` in
    /// `common::db::mariadb`) — comparing at the live stat's full
    /// nanosecond precision would never match a round-tripped value and
    /// the skip would never fire.
    pub fn matches_stat(&self, size: u64, modify_time: DateTime<Utc>) -> bool {
        self.size == size
            && self.modify_time.timestamp_millis() == modify_time.timestamp_millis()
    }
}
