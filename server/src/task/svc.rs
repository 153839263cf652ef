use std::sync::Arc;

use async_cell::sync::AsyncCell;
use async_trait::async_trait;
use common::config::Config;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, instrument, warn, Level};

use crate::fs::msg::FsMsg;
use crate::service::{ESInner, ESMReceiver, ESMRegistry, EntanglementService, ServiceType, ESM};
use crate::task::cron::{CronSchedule, CronTicker, SystemClock};
use crate::task::msg::TaskMsg;

/// How often the ticker is polled against the clock. A scan's own cron
/// resolution is one second (`spec.md` §4.7's default is
/// `0 0 2 * * *`), so polling any coarser risks missing the matching
/// second entirely.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the recurring scan trigger (`spec.md` §4.7/§9: "a ticking task
/// that calls `startScan`", not framework/annotation magic). A first-class
/// component rather than a cron *library* because the schedule surface
/// this crate needs is narrow and the clock has to be injectable for
/// tests.
pub struct TaskService {
    config: Arc<Config>,
    receiver: Arc<Mutex<ESMReceiver>>,
    handle: AsyncCell<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

#[async_trait]
impl EntanglementService for TaskService {
    type Inner = TaskRunner;

    fn create(config: Arc<Config>, registry: &ESMRegistry) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel::<ESM>(1024);

        registry
            .insert(ServiceType::Task, tx)
            .expect("failed to add task sender to registry");

        TaskService {
            config: config.clone(),
            receiver: Arc::new(Mutex::new(rx)),
            handle: AsyncCell::new(),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self, registry))]
    async fn start(&self, registry: &ESMRegistry) -> anyhow::Result<()> {
        info!("starting task service");

        let receiver = Arc::clone(&self.receiver);
        let state = Arc::new(TaskRunner::new(self.config.clone(), registry.clone())?);

        if self.config.scan.enabled && !self.config.scan.cron.trim().is_empty() {
            let cron_state = state.clone();
            tokio::task::spawn(async move { cron_state.run_cron_loop().await });
        } else {
            debug!("automatic scans disabled, cron loop not started");
        }

        let serve = async move {
            let mut receiver = receiver.lock().await;

            while let Some(msg) = receiver.recv().await {
                let state = Arc::clone(&state);
                tokio::task::spawn(async move {
                    if let Err(err) = state.message_handler(msg).await {
                        error!(service = "task", channel = "esm", error = %err);
                    }
                });
            }

            Err(anyhow::Error::msg("task service esm channel disconnected"))
        };

        self.handle.set(tokio::task::spawn(serve));

        debug!("started task service");
        Ok(())
    }
}

pub struct TaskRunner {
    registry: ESMRegistry,
    ticker: Mutex<Option<CronTicker>>,
}

impl TaskRunner {
    fn new_ticker(config: &Config) -> anyhow::Result<Option<CronTicker>> {
        let raw = config.scan.cron.trim();

        if raw.is_empty() {
            return Ok(None);
        }

        let schedule = CronSchedule::parse(raw)?;
        Ok(Some(CronTicker::new(schedule, Box::new(SystemClock))))
    }

    /// Attempts to start a scan via the fs service. If one is already
    /// running, the tick is dropped with a log line rather than queued
    /// (`spec.md` §4.7: "If a scheduled tick arrives while a scan is
    /// running, it is dropped with a log line (no queuing)."). Returns
    /// whether the dispatch actually started a new scan.
    async fn dispatch_scan(&self) -> anyhow::Result<bool> {
        let fs_sender = self.registry.get(&ServiceType::Fs)?;

        let (tx, rx) = oneshot::channel();

        fs_sender
            .send(ESM::Fs(FsMsg::StartScan { resp: tx }))
            .await
            .map_err(|_| anyhow::Error::msg("fs service channel closed"))?;

        match rx.await {
            Ok(Ok(())) => {
                info!("scheduled scan started");
                Ok(true)
            }
            Ok(Err(err)) => {
                warn!(%err, "scheduled scan tick dropped: a scan is already running");
                Ok(false)
            }
            Err(_) => Err(anyhow::Error::msg(
                "fs service dropped the response channel",
            )),
        }
    }

    async fn run_cron_loop(self: Arc<Self>) {
        let mut poll = interval(POLL_INTERVAL);

        loop {
            poll.tick().await;

            let fired = {
                let mut ticker = self.ticker.lock().await;
                ticker.as_mut().map(|t| t.poll()).unwrap_or(false)
            };

            if fired {
                let _ = self.dispatch_scan().await;
            }
        }
    }
}

#[async_trait]
impl ESInner for TaskRunner {
    fn new(config: Arc<Config>, registry: ESMRegistry) -> anyhow::Result<Self> {
        Ok(TaskRunner {
            registry,
            ticker: Mutex::new(Self::new_ticker(&config)?),
        })
    }

    fn registry(&self) -> ESMRegistry {
        self.registry.clone()
    }

    async fn message_handler(&self, esm: ESM) -> anyhow::Result<()> {
        match esm {
            ESM::Task(message) => match message {
                TaskMsg::ForceTick { resp } => {
                    self.respond(resp, async {
                        let fired = {
                            let mut ticker = self.ticker.lock().await;
                            ticker.as_mut().map(|t| t.poll()).unwrap_or(false)
                        };

                        if fired {
                            self.dispatch_scan().await
                        } else {
                            Ok(false)
                        }
                    })
                    .await
                }
            },
            _ => Err(anyhow::Error::msg("not implemented")),
        }
    }
}
