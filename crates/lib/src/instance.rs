//! Instances: long-lived workers with a private input queue and a routing index.
//!
//! The manager constructs instances through an [`InstanceRegistry`] and drives each one
//! with [`run_instance`]. The router only ever sees the [`FindBy`] index.

use crate::envelope::{ChatId, RouteKey, RxItem, SlotId, UserId};
use crate::manager::ManagerHandle;
use crate::queues::{Inbox, Outbox};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Routing keys an instance claims. Written by the owning instance, read by lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindBy {
    pub chat_ids: HashSet<ChatId>,
    pub user_ids: HashSet<UserId>,
    pub game_code: Option<String>,
}

impl FindBy {
    pub fn matches(&self, key: &RouteKey) -> bool {
        match key {
            RouteKey::GameCode(code) => self.game_code.as_deref() == Some(code.as_str()),
            RouteKey::Chat(id) => self.chat_ids.contains(id),
            RouteKey::User(id) => self.user_ids.contains(id),
        }
    }
}

pub type SharedFindBy = Arc<RwLock<FindBy>>;

/// What an instance can reach while it runs.
#[derive(Clone)]
pub struct InstanceContext {
    /// `None` for the master instance, which lives outside the pool.
    pub slot_id: Option<SlotId>,
    pub find_by: SharedFindBy,
    pub outbox: Outbox,
    pub inbox: Inbox,
    pub manager: ManagerHandle,
    pub stop: CancellationToken,
}

#[async_trait]
pub trait Instance: Send + 'static {
    type Input: Send + 'static;

    fn name(&self) -> &str;

    /// Called once before the first input is taken.
    async fn start(&mut self, _ctx: &InstanceContext) {}

    /// Handle one input item.
    async fn handle(&mut self, input: Self::Input, ctx: &InstanceContext);

    /// Called after every loop iteration, whether or not an item arrived.
    async fn tick(&mut self, _ctx: &InstanceContext) {}
}

/// Instances living in pool slots take inbound items.
pub type BoxedInstance = Box<dyn Instance<Input = RxItem>>;

/// Constructor for one kind of instance.
pub trait InstanceFactory: Send + Sync {
    /// Build an instance for `slot_id`. Keys claimed in `find_by` are visible as soon as the slot is published.
    fn build(
        &self,
        slot_id: SlotId,
        find_by: &mut FindBy,
        args: &serde_json::Value,
    ) -> anyhow::Result<BoxedInstance>;
}

impl<F> InstanceFactory for F
where
    F: Fn(SlotId, &mut FindBy, &serde_json::Value) -> anyhow::Result<BoxedInstance> + Send + Sync,
{
    fn build(
        &self,
        slot_id: SlotId,
        find_by: &mut FindBy,
        args: &serde_json::Value,
    ) -> anyhow::Result<BoxedInstance> {
        self(slot_id, find_by, args)
    }
}

/// Instance kinds by name.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    kinds: HashMap<String, Arc<dyn InstanceFactory>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: impl InstanceFactory + 'static) {
        self.kinds.insert(kind.into(), Arc::new(factory));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn InstanceFactory>> {
        self.kinds.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Cooperative run loop: wait up to `poll` for one input, handle it, tick, recheck the stop flag.
pub async fn run_instance<I>(
    instance: &mut I,
    mut input: mpsc::UnboundedReceiver<I::Input>,
    ctx: InstanceContext,
    poll: Duration,
) where
    I: Instance + ?Sized,
{
    instance.start(&ctx).await;
    while !ctx.stop.is_cancelled() {
        match tokio::time::timeout(poll, input.recv()).await {
            Ok(Some(item)) => instance.handle(item, &ctx).await,
            Ok(None) => {
                log::debug!("{}: input queue closed", instance.name());
                break;
            }
            Err(_) => {}
        }
        instance.tick(&ctx).await;
    }
    log::debug!("{}: run loop finished", instance.name());
}
