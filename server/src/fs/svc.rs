use std::sync::Arc;

use async_cell::sync::AsyncCell;
use async_trait::async_trait;
use common::config::Config;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, Level};

use crate::fs::coordinator::Coordinator;
use crate::fs::msg::FsMsg;
use crate::service::{ESInner, ESMReceiver, ESMRegistry, EntanglementService, ServiceType, ESM};

/// Owns the scan coordinator and exposes it to the rest of the backend as
/// an actor, like every other stateful service in this process.
pub struct FsService {
    config: Arc<Config>,
    receiver: Arc<Mutex<ESMReceiver>>,
    handle: AsyncCell<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

#[async_trait]
impl EntanglementService for FsService {
    type Inner = FsRunner;

    fn create(config: Arc<Config>, registry: &ESMRegistry) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel::<ESM>(1024);

        registry
            .insert(ServiceType::Fs, tx)
            .expect("failed to add fs sender to registry");

        FsService {
            config: config.clone(),
            receiver: Arc::new(Mutex::new(rx)),
            handle: AsyncCell::new(),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self, registry))]
    async fn start(&self, registry: &ESMRegistry) -> anyhow::Result<()> {
        info!("starting fs service");

        let receiver = Arc::clone(&self.receiver);
        let state = Arc::new(FsRunner::new(self.config.clone(), registry.clone())?);

        let serve = async move {
            let mut receiver = receiver.lock().await;

            while let Some(msg) = receiver.recv().await {
                let state = Arc::clone(&state);
                tokio::task::spawn(async move {
                    if let Err(err) = state.message_handler(msg).await {
                        error!(service = "fs", channel = "esm", error = %err);
                    }
                });
            }

            Err(anyhow::Error::msg("fs service esm channel disconnected"))
        };

        self.handle.set(tokio::task::spawn(serve));

        debug!("started fs service");
        Ok(())
    }
}

pub struct FsRunner {
    registry: ESMRegistry,
    coordinator: Coordinator,
}

#[async_trait]
impl ESInner for FsRunner {
    fn new(config: Arc<Config>, registry: ESMRegistry) -> anyhow::Result<Self> {
        Ok(FsRunner {
            coordinator: Coordinator::new(config, registry.clone()),
            registry,
        })
    }

    fn registry(&self) -> ESMRegistry {
        self.registry.clone()
    }

    async fn message_handler(&self, esm: ESM) -> anyhow::Result<()> {
        match esm {
            ESM::Fs(message) => match message {
                FsMsg::StartScan { resp } => {
                    self.respond(resp, async { Ok(self.coordinator.start_scan().await?) })
                        .await
                }
                FsMsg::CancelScan { resp } => {
                    self.respond(resp, async {
                        self.coordinator.cancel_scan().await;
                        Ok(())
                    })
                    .await
                }
                FsMsg::ScanProgress { resp } => {
                    self.respond(resp, async { Ok(self.coordinator.current_progress().await) })
                        .await
                }
            },
            _ => Err(anyhow::Error::msg("not implemented")),
        }
    }
}
