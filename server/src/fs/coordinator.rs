use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use api::scan::{ScanError, ScanPhase, ScanProgress, ScanStatus};
use chrono::Utc;
use common::config::Config;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::db::adapter::CatalogAdapter;
use crate::fs::progress::ProgressReporter;
use crate::fs::{executor, planner};
use crate::service::{ESMRegistry, ServiceType};

struct RunningScan {
    cancel: Arc<AtomicBool>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// Single-flight entry point (§4.7). The mutex around `running` is the
/// compare-and-swap: holding it across the `is_some()` check and the
/// insert is what makes `startScan` atomic.
pub struct Coordinator {
    config: Arc<Config>,
    registry: ESMRegistry,
    progress: Arc<ProgressReporter>,
    running: Arc<Mutex<Option<RunningScan>>>,
}

impl Coordinator {
    pub fn new(config: Arc<Config>, registry: ESMRegistry) -> Self {
        Coordinator {
            config,
            registry,
            progress: Arc::new(ProgressReporter::new()),
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn progress_reporter(&self) -> Arc<ProgressReporter> {
        self.progress.clone()
    }

    #[instrument(skip(self))]
    pub async fn start_scan(&self) -> Result<(), ScanError> {
        let mut running = self.running.lock().await;

        if running.is_some() {
            return Err(ScanError::AlreadyRunning);
        }

        info!("starting scan");

        let cancel = Arc::new(AtomicBool::new(false));
        let config = self.config.clone();
        let registry = self.registry.clone();
        let progress = self.progress.clone();
        let running_slot = self.running.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::task::spawn(async move {
            run_scan(config, registry, progress, task_cancel).await;
            running_slot.lock().await.take();
        });

        *running = Some(RunningScan { cancel, handle });

        Ok(())
    }

    /// Idempotent: cancelling an already-cancelled or no-longer-running
    /// scan is a no-op.
    pub async fn cancel_scan(&self) {
        if let Some(running) = self.running.lock().await.as_ref() {
            running.cancel.store(true, Ordering::Relaxed);
        }
    }

    pub async fn current_progress(&self) -> ScanProgress {
        self.progress.snapshot().await
    }

    pub async fn is_scanning(&self) -> bool {
        self.progress.is_scanning().await
    }
}

async fn run_scan(
    config: Arc<Config>,
    registry: ESMRegistry,
    progress: Arc<ProgressReporter>,
    cancel: Arc<AtomicBool>,
) {
    progress
        .update(|p| {
            *p = ScanProgress::idle();
            p.status = ScanStatus::Started;
            p.phase = ScanPhase::Collecting;
            p.start_time = Utc::now();
            p.phase_message = "starting scan".to_owned();
        })
        .await;

    let db_sender = match registry.get(&ServiceType::Db) {
        Ok(sender) => sender,
        Err(err) => {
            warn!(%err, "db service unavailable, aborting scan");
            progress
                .update(|p| {
                    p.status = ScanStatus::Error;
                    p.message = Some(format!("db service unavailable: {err}"));
                })
                .await;
            return;
        }
    };

    let adapter = Arc::new(CatalogAdapter::new(db_sender, config.scan.batch_size));

    progress.update(|p| p.status = ScanStatus::Progress).await;

    let plan = match planner::plan(&config.base_path, &adapter, &progress, &cancel).await {
        Ok(plan) => plan,
        Err(err) => {
            warn!(%err, "root path inaccessible or classification failed, aborting scan");
            progress
                .update(|p| {
                    p.status = ScanStatus::Error;
                    p.message = Some(format!("planning failed: {err}"));
                })
                .await;
            return;
        }
    };

    if cancel.load(Ordering::Relaxed) {
        progress.update(|p| p.status = ScanStatus::Cancelled).await;
        return;
    }

    let items: Vec<_> = plan
        .to_add
        .into_iter()
        .chain(plan.to_update.into_iter())
        .collect();

    executor::process(
        items,
        adapter.clone(),
        progress.clone(),
        cancel.clone(),
        config.scan.worker_count(),
    )
    .await;

    if cancel.load(Ordering::Relaxed) {
        progress.update(|p| p.status = ScanStatus::Cancelled).await;
        return;
    }

    executor::run_delete(plan.to_delete, &adapter, &progress, &cancel).await;

    let status = if cancel.load(Ordering::Relaxed) {
        ScanStatus::Cancelled
    } else {
        ScanStatus::Completed
    };

    progress
        .update(|p| {
            p.status = status;
            p.phase = ScanPhase::Completed;
            p.phase_message = "scan finished".to_owned();
        })
        .await;

    info!(?status, "scan finished");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use common::config::{Config, ScanConfig};
    use common::db::fake::FakeBackend;

    use super::*;
    use crate::fs::test_support::spawn_fake_db;
    use crate::service::{ESMRegistry, ServiceType};

    fn test_config(base_path: &std::path::Path) -> Config {
        Config {
            base_path: base_path.to_path_buf(),
            db_path: "fake://unused".to_owned(),
            cache_dir: base_path.to_path_buf(),
            static_dir: None,
            host: None,
            port: None,
            scan: ScanConfig::default(),
        }
    }

    #[tokio::test]
    async fn second_start_scan_while_one_is_running_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));

        let registry = ESMRegistry::new();
        let backend = Arc::new(FakeBackend::new());
        registry
            .insert(ServiceType::Db, spawn_fake_db(backend))
            .unwrap();

        let coordinator = Coordinator::new(config, registry);

        coordinator.start_scan().await.unwrap();
        let second = coordinator.start_scan().await;
        assert!(matches!(second, Err(ScanError::AlreadyRunning)));

        for _ in 0..200 {
            if !coordinator.is_scanning().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let snapshot = coordinator.current_progress().await;
        assert_eq!(snapshot.status, ScanStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_scan_is_idempotent_when_nothing_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let registry = ESMRegistry::new();

        let coordinator = Coordinator::new(config, registry);

        coordinator.cancel_scan().await;
        coordinator.cancel_scan().await;

        assert!(!coordinator.is_scanning().await);
    }
}
