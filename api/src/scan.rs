use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Idle,
    Started,
    Progress,
    Completed,
    Error,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Collecting,
    Counting,
    Processing,
    Deleting,
    Completed,
}

/// In-memory snapshot owned by the progress reporter. Cheap to clone;
/// callers always get a deep copy, never a view into live state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanProgress {
    pub status: ScanStatus,
    pub phase: ScanPhase,
    pub total_files: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub files_to_add: i64,
    pub files_to_update: i64,
    pub files_to_delete: i64,
    pub progress_percentage: String,
    pub start_time: DateTime<Utc>,
    pub phase_message: String,
    pub message: Option<String>,
}

impl ScanProgress {
    pub fn idle() -> Self {
        ScanProgress {
            status: ScanStatus::Idle,
            phase: ScanPhase::Completed,
            total_files: 0,
            success_count: 0,
            failure_count: 0,
            files_to_add: 0,
            files_to_update: 0,
            files_to_delete: 0,
            progress_percentage: "0.0".to_owned(),
            start_time: Utc::now(),
            phase_message: "idle".to_owned(),
            message: None,
        }
    }

    /// True while the coordinator's status is non-idle and non-terminal,
    /// i.e. the phase is somewhere in collecting/counting/processing/deleting.
    pub fn is_scanning(&self) -> bool {
        matches!(self.status, ScanStatus::Started | ScanStatus::Progress)
    }

    /// `floor(100 * (success+failure) / total)` formatted with one decimal,
    /// never regressing within a run (monotonicity invariant #3). `total<=0`
    /// only reads as "100.0" once `status` is terminal (an empty-tree scan,
    /// scenario 1, completes having never set `total_files` above zero);
    /// while still `collecting`/`counting`, `total_files` is legitimately
    /// zero before the planner has finished counting, and reporting 100%
    /// there would regress to a lower value the moment `total` becomes
    /// known, violating the monotonicity invariant.
    pub fn percentage_for(success: i64, failure: i64, total: i64, status: ScanStatus) -> String {
        if total <= 0 {
            return if status == ScanStatus::Completed {
                "100.0".to_owned()
            } else {
                "0.0".to_owned()
            };
        }

        let done = (success + failure) as f64;
        let pct = (100.0 * done / total as f64 * 10.0).floor() / 10.0;

        format!("{pct:.1}")
    }
}

/// The wire envelope pushed to progress observers. One-to-one with
/// `ScanProgress`; `start_time` is flattened to epoch milliseconds at the
/// transport boundary per the persisted timestamp convention.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanProgressWire {
    pub scanning: bool,
    pub phase: ScanPhase,
    pub phase_message: String,
    pub total_files: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub progress_percentage: String,
    pub start_time: i64,
    pub status: ScanStatus,
    pub message: Option<String>,
    pub files_to_add: i64,
    pub files_to_update: i64,
    pub files_to_delete: i64,
}

impl From<&ScanProgress> for ScanProgressWire {
    fn from(p: &ScanProgress) -> Self {
        ScanProgressWire {
            scanning: p.is_scanning(),
            phase: p.phase,
            phase_message: p.phase_message.clone(),
            total_files: p.total_files,
            success_count: p.success_count,
            failure_count: p.failure_count,
            progress_percentage: p.progress_percentage.clone(),
            start_time: p.start_time.timestamp_millis(),
            status: p.status,
            message: p.message.clone(),
            files_to_add: p.files_to_add,
            files_to_update: p.files_to_update,
            files_to_delete: p.files_to_delete,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a scan is already running")]
    AlreadyRunning,
}
