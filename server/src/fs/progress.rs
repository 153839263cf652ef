use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use api::scan::{ScanPhase, ScanProgress, ScanProgressWire, ScanStatus};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

/// Rapid updates during `processing` are coalesced to at most one publish
/// per window; every other phase transition and every terminal snapshot
/// bypasses this entirely (§4.6).
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Thread-safe phase/counter state plus snapshot fan-out. Workers mutate it
/// through `update`; observers read it through `snapshot` or a subscription.
pub struct ProgressReporter {
    state: RwLock<ScanProgress>,
    subscribers: DashMap<u64, mpsc::Sender<ScanProgressWire>>,
    next_id: AtomicU64,
    last_publish: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        ProgressReporter {
            state: RwLock::new(ScanProgress::idle()),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
            last_publish: Mutex::new(None),
        }
    }

    /// Returns a deep copy; callers never observe tearing.
    pub async fn snapshot(&self) -> ScanProgress {
        self.state.read().await.clone()
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.read().await.is_scanning()
    }

    /// Applies a patch under the write lock, recomputes `progressPercentage`
    /// from the updated counters, then publishes (subject to coalescing).
    pub async fn update<F>(&self, patch: F)
    where
        F: FnOnce(&mut ScanProgress),
    {
        let snapshot = {
            let mut state = self.state.write().await;
            patch(&mut state);
            state.progress_percentage = ScanProgress::percentage_for(
                state.success_count,
                state.failure_count,
                state.total_files,
                state.status,
            );
            state.clone()
        };

        self.publish(snapshot).await;
    }

    async fn publish(&self, snapshot: ScanProgress) {
        let terminal = matches!(
            snapshot.status,
            ScanStatus::Completed | ScanStatus::Error | ScanStatus::Cancelled
        );
        let coalescible = snapshot.phase == ScanPhase::Processing && !terminal;

        if coalescible {
            let mut last = self.last_publish.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < COALESCE_WINDOW {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let wire = ScanProgressWire::from(&snapshot);

        for entry in self.subscribers.iter() {
            // best-effort, non-blocking: a slow observer never blocks a worker
            let _ = entry.value().try_send(wire.clone());
        }
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<ScanProgressWire>) {
        let (tx, rx) = mpsc::channel(32);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
        debug!(id, "progress subscriber removed");
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use api::scan::ScanStatus;

    use super::*;

    #[test]
    fn percentage_is_floored_to_one_decimal() {
        assert_eq!(
            ScanProgress::percentage_for(1, 0, 3, ScanStatus::Progress),
            "33.3"
        );
        assert_eq!(
            ScanProgress::percentage_for(2, 0, 3, ScanStatus::Progress),
            "66.6"
        );
        assert_eq!(
            ScanProgress::percentage_for(3, 0, 3, ScanStatus::Progress),
            "100.0"
        );
        assert_eq!(
            ScanProgress::percentage_for(0, 0, 0, ScanStatus::Completed),
            "100.0"
        );
    }

    #[test]
    fn zero_total_before_counting_reports_zero_not_complete() {
        // total_files is legitimately 0 while still collecting/counting;
        // reporting "100.0" there would regress once the real total is
        // known (the bug this test guards against).
        assert_eq!(
            ScanProgress::percentage_for(0, 0, 0, ScanStatus::Started),
            "0.0"
        );
        assert_eq!(
            ScanProgress::percentage_for(0, 0, 0, ScanStatus::Progress),
            "0.0"
        );
    }

    #[tokio::test]
    async fn collecting_and_counting_never_report_premature_completion() {
        let reporter = ProgressReporter::new();

        reporter
            .update(|p| {
                p.status = ScanStatus::Started;
                p.phase = ScanPhase::Collecting;
            })
            .await;
        assert_eq!(reporter.snapshot().await.progress_percentage, "0.0");

        reporter
            .update(|p| {
                p.status = ScanStatus::Progress;
                p.phase = ScanPhase::Counting;
            })
            .await;
        assert_eq!(reporter.snapshot().await.progress_percentage, "0.0");

        // the counting -> processing transition now learns total_files=2;
        // this must read as a continuation of "0.0", never a regression
        // from an earlier false "100.0".
        reporter
            .update(|p| {
                p.phase = ScanPhase::Processing;
                p.total_files = 2;
            })
            .await;
        assert_eq!(reporter.snapshot().await.progress_percentage, "0.0");
    }

    #[tokio::test]
    async fn percentage_never_decreases_across_sequential_updates() {
        let reporter = ProgressReporter::new();

        reporter.update(|p| p.total_files = 10).await;

        let mut last: f64 = 0.0;
        for i in 1..=10 {
            reporter.update(|p| p.success_count = i).await;
            let current: f64 = reporter
                .snapshot()
                .await
                .progress_percentage
                .parse()
                .unwrap();
            assert!(current >= last, "percentage regressed: {last} -> {current}");
            last = current;
        }
    }

    #[tokio::test]
    async fn terminal_snapshots_bypass_coalescing() {
        let reporter = ProgressReporter::new();
        let (_id, mut rx) = reporter.subscribe();

        reporter
            .update(|p| {
                p.phase = ScanPhase::Processing;
                p.total_files = 2;
                p.success_count = 1;
            })
            .await;

        // a second update in the same instant would normally be coalesced
        // away during `processing`, but a terminal status must never be.
        reporter
            .update(|p| {
                p.status = ScanStatus::Completed;
                p.phase = ScanPhase::Completed;
                p.success_count = 2;
            })
            .await;

        let mut last = None;
        while let Ok(wire) = rx.try_recv() {
            last = Some(wire);
        }

        let last = last.expect("expected at least one publish");
        assert_eq!(last.status, ScanStatus::Completed);
        assert_eq!(last.success_count, 2);
    }

    #[tokio::test]
    async fn unsubscribed_observers_receive_nothing_further() {
        let reporter = ProgressReporter::new();
        let (id, mut rx) = reporter.subscribe();

        reporter.update(|p| p.total_files = 1).await;
        assert!(rx.try_recv().is_ok());

        reporter.unsubscribe(id);
        reporter.update(|p| p.success_count = 1).await;
        assert!(rx.try_recv().is_err());
    }
}
