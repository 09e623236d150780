//! Game catalogue and the lobby instance every game starts in.
//!
//! The lobby is the concrete instance kind the master instance creates after onboarding.
//! It owns a game code other chats can use to join, relays chat between players and
//! asks the manager to tear it down once the last player leaves. Game rules live elsewhere.

use crate::envelope::{ChatId, RxItem, RxKind, SlotId, TxItem, UserId};
use crate::instance::{BoxedInstance, FindBy, Instance, InstanceContext};
use crate::platform::update::Update;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, PartialEq, Eq)]
pub struct Game {
    pub id: usize,
    pub name: &'static str,
}

pub static GAMES: [Game; 4] = [
    Game {
        id: 0,
        name: "Guess the picture",
    },
    Game {
        id: 1,
        name: "Dominos",
    },
    Game {
        id: 2,
        name: "Laser fights",
    },
    Game {
        id: 3,
        name: "Sleeper",
    },
];

/// Registry name of the lobby instance kind.
pub const LOBBY_KIND: &str = "lobby";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LobbyArgs {
    game: String,
    chat_id: ChatId,
    user_id: Option<UserId>,
}

/// Construct a lobby from `{ "game": .., "chatId": .., "userId": .. }`.
pub fn build_lobby(
    slot_id: SlotId,
    find_by: &mut FindBy,
    args: &serde_json::Value,
) -> anyhow::Result<BoxedInstance> {
    let args: LobbyArgs =
        serde_json::from_value(args.clone()).context("invalid lobby arguments")?;
    let code = new_game_code();
    find_by.chat_ids.insert(args.chat_id);
    if let Some(user) = args.user_id {
        find_by.user_ids.insert(user);
    }
    find_by.game_code = Some(code.clone());
    Ok(Box::new(Lobby {
        name: format!("{} lobby", args.game),
        game: args.game,
        code,
        slot_id,
        chats: vec![args.chat_id],
    }))
}

fn new_game_code() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_uppercase()
}

pub struct Lobby {
    name: String,
    game: String,
    code: String,
    slot_id: SlotId,
    /// Chats in join order; the first one created the lobby.
    chats: Vec<ChatId>,
}

impl Lobby {
    fn broadcast(&self, ctx: &InstanceContext, except: Option<ChatId>, text: &str) {
        for chat in self.chats.iter().filter(|c| Some(**c) != except) {
            ctx.outbox.put(TxItem::send_message(*chat, text));
        }
    }

    async fn join(&mut self, ctx: &InstanceContext, chat: ChatId, user: Option<UserId>, who: &str) {
        {
            let mut find_by = ctx.find_by.write().await;
            find_by.chat_ids.insert(chat);
            if let Some(user) = user {
                find_by.user_ids.insert(user);
            }
        }
        if !self.chats.contains(&chat) {
            self.chats.push(chat);
        }
        self.broadcast(ctx, None, &format!("{} joined the {} game", who, self.game));
    }

    async fn leave(&mut self, ctx: &InstanceContext, chat: ChatId, user: Option<UserId>, who: &str) {
        {
            let mut find_by = ctx.find_by.write().await;
            find_by.chat_ids.remove(&chat);
            if let Some(user) = user {
                find_by.user_ids.remove(&user);
            }
        }
        self.chats.retain(|c| *c != chat);
        ctx.outbox
            .put(TxItem::send_message(chat, format!("You left the {} game. Bye !", self.game)));
        if self.chats.is_empty() {
            log::info!("{} is empty, requesting teardown", self.name);
            ctx.manager.request_destroy(self.slot_id);
        } else {
            self.broadcast(ctx, None, &format!("{} left the game", who));
        }
    }
}

#[async_trait]
impl Instance for Lobby {
    type Input = RxItem;

    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, ctx: &InstanceContext) {
        self.broadcast(
            ctx,
            None,
            &format!(
                "{} game room is open ! Friends can join with /join {}",
                self.game, self.code
            ),
        );
    }

    async fn handle(&mut self, item: RxItem, ctx: &InstanceContext) {
        let Some(update) = Update::from_payload(&item.payload) else {
            log::debug!("{}: item without update ignored", self.name);
            return;
        };
        let Some(chat) = item.chat_id.or_else(|| update.chat_id()) else {
            return;
        };
        let user = item.user_id.or_else(|| update.user_id());

        if let Some(query) = &update.callback_query {
            ctx.outbox
                .put(TxItem::new("answer_callback_query").arg(query.id.clone()));
            return;
        }
        let Some(message) = update.message else {
            return;
        };
        let who = message
            .from
            .as_ref()
            .map(|u| u.first_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Someone".to_string());
        let text = message.text.unwrap_or_default();

        match item.kind {
            RxKind::Command if text.starts_with("/join") => {
                self.join(ctx, chat, user, &who).await;
            }
            RxKind::Command if text.starts_with("/code") => {
                ctx.outbox.put(TxItem::send_message(
                    chat,
                    format!("Game code: {}", self.code),
                ));
            }
            RxKind::Command if text.starts_with("/quit") => {
                self.leave(ctx, chat, user, &who).await;
            }
            _ => {
                if !text.is_empty() {
                    self.broadcast(ctx, Some(chat), &format!("{}: {}", who, text));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use crate::manager::ManagerHandle;
    use crate::queues::{self, OutboundReceiver};
    use tokio_util::sync::CancellationToken;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn lobby_with_ctx() -> (Box<dyn Instance<Input = RxItem>>, InstanceContext, OutboundReceiver, String) {
        let mut find_by = FindBy::default();
        let lobby = build_lobby(
            0,
            &mut find_by,
            &json!({ "game": "Dominos", "chatId": 100, "userId": 1 }),
        )
        .expect("build");
        let code = find_by.game_code.clone().expect("code claimed");
        let (outbox, rx) = queues::outbound();
        let (inbox, _in) = queues::inbound();
        let ctx = InstanceContext {
            slot_id: Some(0),
            find_by: Arc::new(RwLock::new(find_by)),
            outbox,
            inbox,
            manager: ManagerHandle::disconnected(),
            stop: CancellationToken::new(),
        };
        (lobby, ctx, rx, code)
    }

    fn message(kind: RxKind, chat: i64, user: i64, text: &str) -> RxItem {
        let update = json!({
            "update_id": 1,
            "message": {
                "message_id": 1,
                "chat": { "id": chat },
                "from": { "id": user, "first_name": format!("P{}", user) },
                "text": text
            }
        });
        RxItem::from_conversation(kind, chat, user, Payload::with_update(update))
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<TxItem> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[test]
    fn construction_claims_creator_and_code() {
        let mut find_by = FindBy::default();
        build_lobby(2, &mut find_by, &json!({ "game": "Sleeper", "chatId": 5, "userId": 6 }))
            .expect("build");
        assert!(find_by.chat_ids.contains(&5));
        assert!(find_by.user_ids.contains(&6));
        assert_eq!(find_by.game_code.as_deref().map(str::len), Some(6));
    }

    #[test]
    fn bad_arguments_fail_construction() {
        let mut find_by = FindBy::default();
        assert!(build_lobby(0, &mut find_by, &json!({ "game": "Sleeper" })).is_err());
        assert_eq!(find_by, FindBy::default());
    }

    #[tokio::test]
    async fn join_claims_chat_and_relays_text() {
        let (mut lobby, ctx, mut rx, code) = lobby_with_ctx();
        lobby.start(&ctx).await;
        let opening = drain(&mut rx);
        assert!(opening[0].text().unwrap_or_default().contains(&code));

        lobby
            .handle(message(RxKind::Command, 200, 2, &format!("/join {}", code)), &ctx)
            .await;
        assert!(ctx.find_by.read().await.chat_ids.contains(&200));
        assert_eq!(drain(&mut rx).len(), 2);

        lobby.handle(message(RxKind::Text, 100, 1, "hello"), &ctx).await;
        let out = drain(&mut rx);
        assert_eq!(out, vec![TxItem::send_message(200, "P1: hello")]);
    }

    #[tokio::test]
    async fn quit_releases_chat() {
        let (mut lobby, ctx, mut rx, _) = lobby_with_ctx();
        lobby.handle(message(RxKind::Command, 100, 1, "/quit"), &ctx).await;
        assert!(ctx.find_by.read().await.chat_ids.is_empty());
        assert!(ctx.find_by.read().await.user_ids.is_empty());
        let out = drain(&mut rx);
        assert_eq!(out[0].text(), Some("You left the Dominos game. Bye !"));
    }
}
