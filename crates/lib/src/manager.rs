//! Instance manager: a fixed pool of instance slots plus the always-running master instance.
//!
//! Create and destroy requests are queued as jobs and executed one at a time inside the
//! manager's own task, so slot allocation never races. Lookups read the pool through a lock
//! from any task; only the manager task writes it.

use crate::config::RuntimeConfig;
use crate::envelope::{RouteKey, RxItem, SlotId};
use crate::instance::{run_instance, FindBy, InstanceContext, InstanceRegistry, SharedFindBy};
use crate::master::{MasterInstance, MasterTask};
use crate::queues::{Inbox, Outbox};
use crate::worker::Worker;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("all instance slots are in use")]
    PoolExhausted,

    #[error("instance construction failed: {0}")]
    ConstructionFailed(String),

    #[error("unknown instance kind: {0}")]
    UnknownKind(String),

    #[error("no instance in slot {0}")]
    NoSuchSlot(SlotId),

    #[error("instance manager is not running")]
    Unavailable,
}

/// An occupied pool slot.
struct Slot {
    input: mpsc::UnboundedSender<RxItem>,
    find_by: SharedFindBy,
    worker: Worker,
}

type Pool = Arc<RwLock<Vec<Option<Slot>>>>;

enum Job {
    Create {
        kind: String,
        args: serde_json::Value,
        reply: oneshot::Sender<Result<SlotId, ManagerError>>,
    },
    Destroy {
        slot_id: SlotId,
        reply: Option<oneshot::Sender<Result<(), ManagerError>>>,
    },
}

/// Cloneable front of the manager, handed to the router and to instances.
#[derive(Clone)]
pub struct ManagerHandle {
    jobs: mpsc::UnboundedSender<Job>,
    master: mpsc::UnboundedSender<MasterTask>,
    pool: Pool,
}

impl ManagerHandle {
    /// Queue a create job and wait for its result.
    pub async fn create_instance(
        &self,
        kind: &str,
        args: serde_json::Value,
    ) -> Result<SlotId, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Create {
                kind: kind.to_string(),
                args,
                reply,
            })
            .map_err(|_| ManagerError::Unavailable)?;
        rx.await.map_err(|_| ManagerError::Unavailable)?
    }

    /// Queue a destroy job and wait until the slot is free again.
    pub async fn destroy_instance(&self, slot_id: SlotId) -> Result<(), ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Destroy {
                slot_id,
                reply: Some(reply),
            })
            .map_err(|_| ManagerError::Unavailable)?;
        rx.await.map_err(|_| ManagerError::Unavailable)?
    }

    /// Queue a destroy job without waiting. An instance uses this to end itself.
    pub fn request_destroy(&self, slot_id: SlotId) {
        if self
            .jobs
            .send(Job::Destroy {
                slot_id,
                reply: None,
            })
            .is_err()
        {
            log::debug!("instance manager gone, destroy of slot {} ignored", slot_id);
        }
    }

    /// Slots whose index claims `key`, in slot order.
    pub async fn lookup(&self, key: &RouteKey) -> Vec<SlotId> {
        let pool = self.pool.read().await;
        let mut matches = Vec::new();
        for (slot_id, slot) in pool.iter().enumerate() {
            if let Some(slot) = slot {
                if slot.find_by.read().await.matches(key) {
                    matches.push(slot_id);
                }
            }
        }
        matches
    }

    /// Put `item` on the input queue of `slot_id`. Gives the item back if the slot is empty or closed.
    pub async fn dispatch(&self, slot_id: SlotId, item: RxItem) -> Result<(), RxItem> {
        let pool = self.pool.read().await;
        match pool.get(slot_id).and_then(Option::as_ref) {
            Some(slot) => slot.input.send(item).map_err(|e| e.0),
            None => Err(item),
        }
    }

    pub fn send_to_master(&self, task: MasterTask) -> Result<(), MasterTask> {
        self.master.send(task).map_err(|e| e.0)
    }

    /// Occupied slot ids, in order.
    pub async fn occupied(&self) -> Vec<SlotId> {
        self.pool
            .read()
            .await
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    /// Index snapshot of one slot.
    pub async fn find_by(&self, slot_id: SlotId) -> Option<FindBy> {
        let pool = self.pool.read().await;
        match pool.get(slot_id).and_then(Option::as_ref) {
            Some(slot) => Some(slot.find_by.read().await.clone()),
            None => None,
        }
    }

    /// Handle whose queues lead nowhere: every job fails with `Unavailable`.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        let (jobs, _) = mpsc::unbounded_channel();
        let (master, _) = mpsc::unbounded_channel();
        Self {
            jobs,
            master,
            pool: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

/// State owned by the manager task.
pub struct InstanceManager {
    config: RuntimeConfig,
    registry: InstanceRegistry,
    pool: Pool,
    jobs: mpsc::UnboundedReceiver<Job>,
    master: Option<Worker>,
    handle: ManagerHandle,
    outbox: Outbox,
    inbox: Inbox,
}

impl InstanceManager {
    /// Start the master instance and the manager task. Stopping the returned worker stops
    /// the master first and then every occupied slot in index order.
    pub fn start(
        config: RuntimeConfig,
        registry: InstanceRegistry,
        outbox: Outbox,
        inbox: Inbox,
    ) -> (ManagerHandle, Worker) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (master_tx, master_rx) = mpsc::unbounded_channel();
        let pool: Pool = Arc::new(RwLock::new(
            (0..config.pool_capacity).map(|_| None).collect(),
        ));
        let handle = ManagerHandle {
            jobs: jobs_tx,
            master: master_tx,
            pool: pool.clone(),
        };

        let master_stop = CancellationToken::new();
        let master_ctx = InstanceContext {
            slot_id: None,
            find_by: SharedFindBy::default(),
            outbox: outbox.clone(),
            inbox: inbox.clone(),
            manager: handle.clone(),
            stop: master_stop.clone(),
        };
        let poll = config.poll_interval();
        let mut master = MasterInstance::new(config.session_timeout());
        let master = Worker::spawn("master instance", master_stop, async move {
            run_instance(&mut master, master_rx, master_ctx, poll).await;
        });

        let manager = InstanceManager {
            config,
            registry,
            pool,
            jobs: jobs_rx,
            master: Some(master),
            handle: handle.clone(),
            outbox,
            inbox,
        };
        let stop = CancellationToken::new();
        let worker = Worker::spawn("instance manager", stop.clone(), manager.run(stop));
        (handle, worker)
    }

    async fn run(mut self, stop: CancellationToken) {
        let poll = self.config.poll_interval();
        loop {
            if stop.is_cancelled() {
                self.stop_all().await;
                break;
            }
            let job = match tokio::time::timeout(poll, self.jobs.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    self.stop_all().await;
                    break;
                }
                Err(_) => continue,
            };
            match job {
                Job::Create { kind, args, reply } => {
                    let result = self.create(&kind, &args).await;
                    let _ = reply.send(result);
                }
                Job::Destroy { slot_id, reply } => {
                    let result = self.destroy(slot_id).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                log::warn!("destroy request for slot {}: {}", slot_id, e);
                            }
                        }
                    }
                }
            }
        }
        log::info!("instance manager stopped");
    }

    async fn create(&mut self, kind: &str, args: &serde_json::Value) -> Result<SlotId, ManagerError> {
        let factory = self
            .registry
            .get(kind)
            .ok_or_else(|| ManagerError::UnknownKind(kind.to_string()))?;
        let slot_id = self
            .pool
            .read()
            .await
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| {
                log::info!("cannot create {} instance: all slots are full", kind);
                ManagerError::PoolExhausted
            })?;

        let mut find_by = FindBy::default();
        let built = panic::catch_unwind(AssertUnwindSafe(|| factory.build(slot_id, &mut find_by, args)))
            .unwrap_or_else(|payload| Err(anyhow::anyhow!("constructor panicked: {}", panic_message(&*payload))));
        let mut instance = built.map_err(|e| {
            log::error!("failed to create {} instance: {:#}", kind, e);
            ManagerError::ConstructionFailed(format!("{:#}", e))
        })?;

        let find_by = Arc::new(RwLock::new(find_by));
        let (input, input_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let ctx = InstanceContext {
            slot_id: Some(slot_id),
            find_by: find_by.clone(),
            outbox: self.outbox.clone(),
            inbox: self.inbox.clone(),
            manager: self.handle.clone(),
            stop: stop.clone(),
        };
        let poll = self.config.poll_interval();
        let name = format!("{} #{}", instance.name(), slot_id);
        let worker = Worker::spawn(name, stop, async move {
            run_instance(&mut *instance, input_rx, ctx, poll).await;
        });

        self.pool.write().await[slot_id] = Some(Slot {
            input,
            find_by,
            worker,
        });
        log::info!("created {} instance in slot {}", kind, slot_id);
        Ok(slot_id)
    }

    async fn destroy(&mut self, slot_id: SlotId) -> Result<(), ManagerError> {
        let slot = self
            .pool
            .write()
            .await
            .get_mut(slot_id)
            .and_then(Option::take)
            .ok_or(ManagerError::NoSuchSlot(slot_id))?;
        self.stop_slot(slot_id, slot).await;
        Ok(())
    }

    async fn stop_slot(&self, slot_id: SlotId, slot: Slot) {
        let Slot { input, worker, .. } = slot;
        drop(input);
        if let Err(e) = worker.stop(self.config.stop_timeout()).await {
            log::error!("failed to gracefully stop instance {}: {}", slot_id, e);
        }
    }

    async fn stop_all(&mut self) {
        if let Some(master) = self.master.take() {
            if let Err(e) = master.stop(self.config.stop_timeout()).await {
                log::error!("failed to gracefully stop master instance: {}", e);
            }
        }
        let occupied: Vec<(SlotId, Slot)> = self
            .pool
            .write()
            .await
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.take().map(|s| (i, s)))
            .collect();
        for (slot_id, slot) in occupied {
            self.stop_slot(slot_id, slot).await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
