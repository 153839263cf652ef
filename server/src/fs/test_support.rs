use std::sync::Arc;

use common::db::fake::FakeBackend;
use common::db::CatalogBackend;

use crate::db::msg::DbMsg;
use crate::service::{ESMSender, ESM};

/// Spins up a minimal actor over a [`FakeBackend`], answering the same
/// `DbMsg` contract `server::db::svc::DbRunner` does over a real MariaDB
/// pool. Planner/executor/adapter tests drive the catalog through this
/// sender exactly the way production code drives the real db service,
/// without needing a database.
pub fn spawn_fake_db(backend: Arc<FakeBackend>) -> ESMSender {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ESM>(1024);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let backend = backend.clone();

            tokio::spawn(async move {
                let ESM::Db(msg) = msg else {
                    return;
                };

                match msg {
                    DbMsg::FindByPath { resp, path } => {
                        let _ = resp.send(
                            backend
                                .find_by_path(&path)
                                .await
                                .map_err(anyhow::Error::from),
                        );
                    }
                    DbMsg::FindAll { resp } => {
                        let _ = resp.send(backend.find_all().await.map_err(anyhow::Error::from));
                    }
                    DbMsg::AllPaths { resp } => {
                        let _ = resp.send(backend.all_paths().await.map_err(anyhow::Error::from));
                    }
                    DbMsg::SaveAll { resp, batch } => {
                        let _ = resp.send(backend.save_all(batch).await.map_err(anyhow::Error::from));
                    }
                    DbMsg::Delete { resp, paths } => {
                        let _ = resp.send(backend.delete(paths).await.map_err(anyhow::Error::from));
                    }
                    DbMsg::Count { resp } => {
                        let _ = resp.send(backend.count().await.map_err(anyhow::Error::from));
                    }
                    DbMsg::UpsertDirectory { resp, dir } => {
                        let _ = resp.send(
                            backend
                                .upsert_directory(dir)
                                .await
                                .map_err(anyhow::Error::from),
                        );
                    }
                }
            });
        }
    });

    tx
}
