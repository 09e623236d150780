//! Core wiring: inbound queue, instance manager (with the master instance) and router.
//!
//! The platform side is left to the caller: it feeds [`Runtime::inbox`] and drains the
//! outbound queue whose producer it passed to [`Runtime::start`].

use crate::config::RuntimeConfig;
use crate::games::{build_lobby, LOBBY_KIND};
use crate::instance::InstanceRegistry;
use crate::manager::{InstanceManager, ManagerHandle};
use crate::queues::{self, Inbox, Outbox};
use crate::router::Router;
use crate::worker::Worker;
use tokio_util::sync::CancellationToken;

/// Instance kinds the master instance can hand conversations to.
pub fn default_registry() -> InstanceRegistry {
    let mut registry = InstanceRegistry::new();
    registry.register(LOBBY_KIND, build_lobby);
    registry
}

pub struct Runtime {
    config: RuntimeConfig,
    inbox: Inbox,
    manager: ManagerHandle,
    manager_worker: Worker,
    router: Worker,
}

impl Runtime {
    /// Start the manager (which starts the master instance) and the router. Must run inside a tokio runtime.
    pub fn start(config: RuntimeConfig, registry: InstanceRegistry, outbox: Outbox) -> Self {
        let (inbox, inbound_rx) = queues::inbound();
        let (manager, manager_worker) =
            InstanceManager::start(config.clone(), registry, outbox, inbox.clone());

        let router_stop = CancellationToken::new();
        let router = Router::new(manager.clone(), inbox.clone(), config.max_delivery_attempts);
        let router = Worker::spawn(
            "router",
            router_stop.clone(),
            router.run(inbound_rx, router_stop, config.poll_interval()),
        );

        Self {
            config,
            inbox,
            manager,
            manager_worker,
            router,
        }
    }

    /// Producer handle for platform events.
    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub fn manager(&self) -> &ManagerHandle {
        &self.manager
    }

    /// Stop the router, then the manager (master instance first, then slots in index order).
    pub async fn shutdown(self) {
        log::info!("shutting down runtime");
        if let Err(e) = self.router.stop(self.config.stop_timeout()).await {
            log::error!("{}", e);
        }
        if let Err(e) = self
            .manager_worker
            .stop(self.config.manager_stop_timeout())
            .await
        {
            log::error!("{}", e);
        }
        log::info!("runtime stopped");
    }
}
