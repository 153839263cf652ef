use std::sync::Arc;

use async_cell::sync::AsyncCell;
use async_trait::async_trait;
use common::config::Config;
use common::db::{CatalogBackend, MariaDbBackend};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, Level};

use crate::db::msg::DbMsg;
use crate::service::{ESInner, ESMReceiver, ESMRegistry, EntanglementService, ServiceType, ESM};

// db service
//
// owns the one connection pool to the catalog store and serializes every
// catalog operation through the actor's message loop. callers (the fs
// service's catalog adapter) never touch `MariaDbBackend` directly.
pub struct DbService {
    config: Arc<Config>,
    receiver: Arc<Mutex<ESMReceiver>>,
    handle: AsyncCell<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

#[async_trait]
impl EntanglementService for DbService {
    type Inner = DbRunner;

    fn create(config: Arc<Config>, registry: &ESMRegistry) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel::<ESM>(1024);

        registry
            .insert(ServiceType::Db, tx)
            .expect("failed to add db sender to registry");

        DbService {
            config: config.clone(),
            receiver: Arc::new(Mutex::new(rx)),
            handle: AsyncCell::new(),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self, registry))]
    async fn start(&self, registry: &ESMRegistry) -> anyhow::Result<()> {
        info!("starting db service");

        let receiver = Arc::clone(&self.receiver);
        let state = Arc::new(DbRunner::new(self.config.clone(), registry.clone())?);

        let serve = async move {
            let mut receiver = receiver.lock().await;

            while let Some(msg) = receiver.recv().await {
                let state = Arc::clone(&state);
                tokio::task::spawn(async move {
                    if let Err(err) = state.message_handler(msg).await {
                        error!(service = "db", channel = "esm", error = %err);
                    }
                });
            }

            Err(anyhow::Error::msg("db service esm channel disconnected"))
        };

        self.handle.set(tokio::task::spawn(serve));

        debug!("started db service");
        Ok(())
    }
}

pub struct DbRunner {
    registry: ESMRegistry,
    backend: MariaDbBackend,
}

#[async_trait]
impl ESInner for DbRunner {
    fn new(config: Arc<Config>, registry: ESMRegistry) -> anyhow::Result<Self> {
        Ok(DbRunner {
            registry,
            backend: MariaDbBackend::new(config)?,
        })
    }

    fn registry(&self) -> ESMRegistry {
        self.registry.clone()
    }

    async fn message_handler(&self, esm: ESM) -> anyhow::Result<()> {
        match esm {
            ESM::Db(message) => match message {
                DbMsg::FindByPath { resp, path } => {
                    self.respond(resp, async { Ok(self.backend.find_by_path(&path).await?) })
                        .await
                }
                DbMsg::FindAll { resp } => {
                    self.respond(resp, async { Ok(self.backend.find_all().await?) })
                        .await
                }
                DbMsg::AllPaths { resp } => {
                    self.respond(resp, async { Ok(self.backend.all_paths().await?) })
                        .await
                }
                DbMsg::SaveAll { resp, batch } => {
                    self.respond(resp, async { Ok(self.backend.save_all(batch).await?) })
                        .await
                }
                DbMsg::Delete { resp, paths } => {
                    self.respond(resp, async { Ok(self.backend.delete(paths).await?) })
                        .await
                }
                DbMsg::Count { resp } => {
                    self.respond(resp, async { Ok(self.backend.count().await?) })
                        .await
                }
                DbMsg::UpsertDirectory { resp, dir } => {
                    self.respond(resp, async { Ok(self.backend.upsert_directory(dir).await?) })
                        .await
                }
            },
            _ => Err(anyhow::Error::msg("not implemented")),
        }
    }
}
