//! The two process-wide queues.
//!
//! Inbound: the platform (and workers) put `RxItem`s; only the router takes them.
//! Outbound: sessions and instances put `TxItem`s; only the platform executor takes them.
//! Both are unbounded so the router can requeue onto its own input without blocking.

use crate::envelope::{RxItem, TxItem};
use tokio::sync::mpsc;

pub type InboundReceiver = mpsc::UnboundedReceiver<RxItem>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<TxItem>;

/// Producer side of the inbound queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Inbox {
    tx: mpsc::UnboundedSender<RxItem>,
}

impl Inbox {
    /// Put an item at the tail. Returns the item back if the router is gone.
    pub fn put(&self, item: RxItem) -> Result<(), RxItem> {
        self.tx.send(item).map_err(|e| e.0)
    }
}

/// Producer side of the outbound queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<TxItem>,
}

impl Outbox {
    /// Fire-and-forget: delivery is not confirmed, a closed queue is only logged.
    pub fn put(&self, item: TxItem) {
        if let Err(e) = self.tx.send(item) {
            log::debug!("outbound queue closed, dropping {}", e.0.command_name);
        }
    }
}

pub fn inbound() -> (Inbox, InboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Inbox { tx }, rx)
}

pub fn outbound() -> (Outbox, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox { tx }, rx)
}
