//! Router: the only consumer of the inbound queue.
//!
//! For each item it looks up the instances claiming the item's ids (game code, then chat,
//! then user) and either dispatches to the unique match, hands the item to the master
//! instance for onboarding, or requeues it at the tail with one more delivery attempt.

use crate::envelope::{IdKind, RxItem, SlotId};
use crate::manager::ManagerHandle;
use crate::master::MasterTask;
use crate::queues::{InboundReceiver, Inbox};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of resolving an item against the instance index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Routed(SlotId),
    NotFound,
    Ambiguous(Vec<SlotId>),
}

/// What the router did with one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Dispatched(SlotId),
    Onboarding,
    Requeued { attempts: u32 },
    Dropped,
}

/// What the router needs from the instance manager.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Slots whose index claims the item's id of `kind`.
    async fn lookup(&self, item: &RxItem, kind: IdKind) -> Vec<SlotId>;

    /// Put the item on a slot's input queue; the item comes back if the slot does not accept it.
    async fn dispatch(&self, slot_id: SlotId, item: RxItem) -> Result<(), RxItem>;

    /// Hand the item to the master instance. False if the master instance is gone.
    fn onboard(&self, item: RxItem) -> bool;
}

#[async_trait]
impl Dispatcher for ManagerHandle {
    async fn lookup(&self, item: &RxItem, kind: IdKind) -> Vec<SlotId> {
        match item.route_key(kind) {
            Some(key) => ManagerHandle::lookup(self, &key).await,
            None => Vec::new(),
        }
    }

    async fn dispatch(&self, slot_id: SlotId, item: RxItem) -> Result<(), RxItem> {
        ManagerHandle::dispatch(self, slot_id, item).await
    }

    fn onboard(&self, item: RxItem) -> bool {
        self.send_to_master(MasterTask::Onboard(item)).is_ok()
    }
}

pub struct Router<D> {
    dispatcher: D,
    inbox: Inbox,
    max_attempts: u32,
}

impl<D: Dispatcher> Router<D> {
    /// `inbox` must feed the queue this router consumes; it is used for requeues.
    pub fn new(dispatcher: D, inbox: Inbox, max_attempts: u32) -> Self {
        Self {
            dispatcher,
            inbox,
            max_attempts,
        }
    }

    /// First id type with exactly one match wins; all-empty is `NotFound`; otherwise `Ambiguous`.
    pub async fn route(&self, item: &RxItem) -> Route {
        let mut candidates: Vec<SlotId> = Vec::new();
        for kind in IdKind::PRIORITY {
            if !item.route_by.contains(kind) {
                continue;
            }
            let matches = self.dispatcher.lookup(item, kind).await;
            if let [only] = matches.as_slice() {
                return Route::Routed(*only);
            }
            for slot_id in matches {
                if !candidates.contains(&slot_id) {
                    candidates.push(slot_id);
                }
            }
        }
        if candidates.is_empty() {
            Route::NotFound
        } else {
            Route::Ambiguous(candidates)
        }
    }

    pub async fn deliver(&self, item: RxItem) -> Delivery {
        if !item.is_routable() {
            log::warn!(
                "dropping {:?} item without any id to route by ({:?})",
                item.kind,
                item.route_by
            );
            return Delivery::Dropped;
        }
        if item.delivery_attempts > self.max_attempts {
            log::warn!(
                "dropping item for chat {:?} user {:?} after {} delivery attempts",
                item.chat_id,
                item.user_id,
                item.delivery_attempts
            );
            return Delivery::Dropped;
        }
        match self.route(&item).await {
            Route::Routed(slot_id) => match self.dispatcher.dispatch(slot_id, item).await {
                Ok(()) => Delivery::Dispatched(slot_id),
                Err(item) => {
                    log::debug!("instance {} is not accepting items, requeueing", slot_id);
                    self.requeue(item)
                }
            },
            Route::NotFound => {
                let chat = item.chat_id;
                if self.dispatcher.onboard(item) {
                    Delivery::Onboarding
                } else {
                    log::error!("master instance unavailable, dropping item for chat {:?}", chat);
                    Delivery::Dropped
                }
            }
            Route::Ambiguous(candidates) => {
                log::debug!(
                    "item for chat {:?} matches instances {:?}, requeueing",
                    item.chat_id,
                    candidates
                );
                self.requeue(item)
            }
        }
    }

    fn requeue(&self, mut item: RxItem) -> Delivery {
        item.delivery_attempts += 1;
        let attempts = item.delivery_attempts;
        match self.inbox.put(item) {
            Ok(()) => Delivery::Requeued { attempts },
            Err(_) => Delivery::Dropped,
        }
    }

    /// Consume `items` until `stop` is set, rechecking the flag at least every `poll`.
    pub async fn run(self, mut items: InboundReceiver, stop: CancellationToken, poll: Duration) {
        log::info!("router started");
        while !stop.is_cancelled() {
            match tokio::time::timeout(poll, items.recv()).await {
                Ok(Some(item)) => {
                    self.deliver(item).await;
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        log::info!("router stopped");
    }
}
