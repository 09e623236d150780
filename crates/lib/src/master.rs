//! Master instance: fallback target for items no instance claims.
//!
//! Keeps one onboarding [`Session`] per chat, drives it with each unmatched item, performs
//! the instance hand-off the session asks for, and sweeps idle or finished sessions after
//! every loop iteration. Eviction latency is therefore bounded by the poll interval.

use crate::envelope::{ChatId, RxItem};
use crate::games::LOBBY_KIND;
use crate::instance::{Instance, InstanceContext};
use crate::manager::ManagerError;
use crate::platform::update::Update;
use crate::session::{Advance, Session, SessionEvent};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Work items for the master instance.
#[derive(Debug, Clone)]
pub enum MasterTask {
    /// An item no instance claimed: create or advance the chat's session.
    Onboard(RxItem),
    /// End the chat's session now, with a farewell.
    EndSession(ChatId),
}

pub struct MasterInstance {
    sessions: HashMap<ChatId, Session>,
    session_timeout: Duration,
}

impl MasterInstance {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            session_timeout,
        }
    }

    pub fn session(&self, chat: ChatId) -> Option<&Session> {
        self.sessions.get(&chat)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn onboard(&mut self, item: RxItem, ctx: &InstanceContext) {
        let update = Update::from_payload(&item.payload);
        let Some(chat) = item
            .chat_id
            .or_else(|| update.as_ref().and_then(Update::chat_id))
        else {
            log::warn!("onboarding item without a chat id dropped");
            return;
        };
        let event = match update {
            Some(update) => SessionEvent::Update(update),
            None => SessionEvent::Malformed,
        };

        let session = self.sessions.entry(chat).or_insert_with(|| {
            log::debug!("new onboarding session for chat {}", chat);
            Session::select_game(ctx.outbox.clone(), Instant::now())
        });

        let mut outcome = session.advance(event, Instant::now());
        while let Advance::CreateInstance(game) = outcome {
            let args = json!({
                "game": game.name,
                "chatId": chat,
                "userId": session.with_user(),
            });
            let created = tokio::select! {
                r = ctx.manager.create_instance(LOBBY_KIND, args) => r,
                _ = ctx.stop.cancelled() => Err(ManagerError::Unavailable),
            };
            let event = match created {
                Ok(slot_id) => SessionEvent::InstanceCreated(slot_id),
                Err(e) => {
                    log::warn!("could not create {} instance for chat {}: {}", game.name, chat, e);
                    SessionEvent::InstanceFailed(e.to_string())
                }
            };
            outcome = session.advance(event, Instant::now());
        }
    }

    fn end_session(&mut self, chat: ChatId) {
        match self.sessions.remove(&chat) {
            Some(mut session) => session.end(),
            None => log::debug!("no session to end for chat {}", chat),
        }
    }

    /// Drop finished sessions silently and end sessions idle for longer than the timeout.
    pub fn sweep(&mut self, now: Instant) {
        let timeout = self.session_timeout;
        self.sessions.retain(|chat, session| {
            if session.is_terminal() {
                log::debug!("session for chat {} finished in {:?}", chat, session.state());
                return false;
            }
            if session.idle_for(now) > timeout {
                log::info!("session for chat {} timed out", chat);
                session.end();
                return false;
            }
            true
        });
    }
}

#[async_trait]
impl Instance for MasterInstance {
    type Input = MasterTask;

    fn name(&self) -> &str {
        "master instance"
    }

    async fn handle(&mut self, task: MasterTask, ctx: &InstanceContext) {
        match task {
            MasterTask::Onboard(item) => self.onboard(item, ctx).await,
            MasterTask::EndSession(chat) => self.end_session(chat),
        }
    }

    async fn tick(&mut self, _ctx: &InstanceContext) {
        self.sweep(Instant::now());
    }
}
