use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

// the services that make up the scanner backend
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ServiceType {
    Db,
    Fs,
    Task,
}

// scanner service messages
//
// without higher-kinded types, we use the normal enum-of-enums to enable
// general safe message passing between services
pub type ESMSender = tokio::sync::mpsc::Sender<ESM>;
pub type ESMReceiver = tokio::sync::mpsc::Receiver<ESM>;

// message responses are carried back via oneshot channels; this type
// eliminates quite a bit of boilerplate in the responder logic
pub type ESMResp<T> = tokio::sync::oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub enum ESM {
    Db(crate::db::msg::DbMsg),
    Fs(crate::fs::msg::FsMsg),
    Task(crate::task::msg::TaskMsg),
}

// service registry
//
// each service is instantiated once, under one message namespace, so a
// DashMap-backed lookup is sufficient; services that call each other
// frequently are free to clone the sender out instead of repeating the
// lookup on every call.
#[derive(Clone, Debug)]
pub struct ESMRegistry(Arc<DashMap<ServiceType, ESMSender>>);

impl ESMRegistry {
    pub fn new() -> Self {
        ESMRegistry(Arc::new(DashMap::new()))
    }

    pub fn insert(&self, k: ServiceType, v: ESMSender) -> Result<()> {
        match self.0.insert(k.clone(), v) {
            None => Ok(()),
            Some(w) => {
                self.0.insert(k, w);
                Err(anyhow::Error::msg(
                    "internal error: a sender was added twice to the registry",
                ))
            }
        }
    }

    pub fn get(&self, k: &ServiceType) -> Result<ESMSender> {
        Ok(self
            .0
            .get(k)
            .ok_or_else(|| {
                anyhow::Error::msg(format!(
                    "internal error: a service was started without a necessary dependency ({:?})",
                    k
                ))
            })?
            .clone())
    }
}

impl Default for ESMRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// core service trait
#[async_trait]
pub trait EntanglementService: Send + Sync + 'static {
    type Inner: ESInner;

    fn create(config: Arc<common::config::Config>, registry: &ESMRegistry) -> Self;

    async fn start(&self, registry: &ESMRegistry) -> Result<()>;
}

// service message responder
//
// services may respond to external messages on other channels as well;
// in the spirit of tower, the magic of the service model is in the
// message_handler rpc function.
#[async_trait]
pub trait ESInner: Sized + Send + Sync + 'static {
    fn new(config: Arc<common::config::Config>, registry: ESMRegistry) -> Result<Self>;

    fn registry(&self) -> ESMRegistry;

    async fn message_handler(&self, esm: ESM) -> Result<()>;

    // rather than have the inner service trait functions (the rpc calls)
    // respond directly, this helper is used in the message_handler loop so
    // rpc functions can call each other without any weird Option<resp>
    async fn respond<T, Fut>(&self, resp: ESMResp<T>, fut: Fut) -> Result<()>
    where
        T: Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        resp.send(fut.await).map_err(|_| {
            anyhow::Error::msg(format!(
                "failed to respond to a {} message",
                std::any::type_name::<T>()
            ))
        })
    }
}
