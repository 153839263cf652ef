use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type DirectoryUuid = i64;

/// Coarse aggregate index of scanned folders, maintained lazily for UI
/// purposes only. The scan never treats this as a correctness source; see
/// the planner, which diffs against `media_files`, not `directories`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Directory {
    pub path: String,
    pub parent_id: Option<DirectoryUuid>,
    pub file_count: i64,
    pub last_modified: DateTime<Utc>,
}
