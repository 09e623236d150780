//! Queue envelopes: inbound platform events (`RxItem`) and outbound platform calls (`TxItem`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Platform chat id (Telegram chat ids are signed 64-bit).
pub type ChatId = i64;
/// Platform user id.
pub type UserId = i64;
/// Index of an instance slot in the manager's pool.
pub type SlotId = usize;

/// What kind of platform event an inbound item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RxKind {
    Text,
    Command,
    Callback,
}

/// The id types an item can be routed by. The router evaluates them in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    GameCode,
    Chat,
    User,
}

impl IdKind {
    /// Fixed routing priority: game code, then chat, then user.
    pub const PRIORITY: [IdKind; 3] = [IdKind::GameCode, IdKind::Chat, IdKind::User];

    fn bit(self) -> u8 {
        match self {
            IdKind::Chat => 1,
            IdKind::User => 2,
            IdKind::GameCode => 4,
        }
    }
}

/// Bit-mask of [`IdKind`]s; several can be combined with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteBy(u8);

impl RouteBy {
    pub const CHAT: RouteBy = RouteBy(1);
    pub const USER: RouteBy = RouteBy(2);
    pub const GAME_CODE: RouteBy = RouteBy(4);

    pub fn contains(self, kind: IdKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl std::ops::BitOr for RouteBy {
    type Output = RouteBy;

    fn bitor(self, rhs: RouteBy) -> RouteBy {
        RouteBy(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for RouteBy {
    fn bitor_assign(&mut self, rhs: RouteBy) {
        self.0 |= rhs.0;
    }
}

/// A routing key value: what a slot's index is searched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKey {
    GameCode(String),
    Chat(ChatId),
    User(UserId),
}

/// Opaque argument bag carried with an item (positional + named).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Payload {
    /// Payload carrying a raw platform update under the `update` key.
    pub fn with_update(update: Value) -> Self {
        let mut kwargs = Map::new();
        kwargs.insert("update".to_string(), update);
        Self {
            args: Vec::new(),
            kwargs,
        }
    }

    pub fn update(&self) -> Option<&Value> {
        self.kwargs.get("update")
    }
}

/// Inbound item: one platform event on its way to the instance that owns the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct RxItem {
    pub kind: RxKind,
    pub route_by: RouteBy,
    pub chat_id: Option<ChatId>,
    pub user_id: Option<UserId>,
    pub game_code: Option<String>,
    pub payload: Payload,
    /// Times the router has requeued this item. Starts at 0, only grows.
    pub delivery_attempts: u32,
}

impl RxItem {
    /// Item routed by chat and user, the shape the platform produces for ordinary messages.
    pub fn from_conversation(kind: RxKind, chat_id: ChatId, user_id: UserId, payload: Payload) -> Self {
        Self {
            kind,
            route_by: RouteBy::CHAT | RouteBy::USER,
            chat_id: Some(chat_id),
            user_id: Some(user_id),
            game_code: None,
            payload,
            delivery_attempts: 0,
        }
    }

    /// Additionally route by a game code (checked before chat and user).
    pub fn with_game_code(mut self, code: impl Into<String>) -> Self {
        self.game_code = Some(code.into());
        self.route_by |= RouteBy::GAME_CODE;
        self
    }

    /// Key for `kind` when `route_by` asks for it and the id is present.
    pub fn route_key(&self, kind: IdKind) -> Option<RouteKey> {
        if !self.route_by.contains(kind) {
            return None;
        }
        match kind {
            IdKind::GameCode => self.game_code.clone().map(RouteKey::GameCode),
            IdKind::Chat => self.chat_id.map(RouteKey::Chat),
            IdKind::User => self.user_id.map(RouteKey::User),
        }
    }

    /// True if at least one id referenced by `route_by` is present.
    pub fn is_routable(&self) -> bool {
        IdKind::PRIORITY.iter().any(|k| self.route_key(*k).is_some())
    }
}

/// Outbound item: a named platform operation with its arguments, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxItem {
    pub command_name: String,
    #[serde(default)]
    pub positional_args: Vec<Value>,
    #[serde(default)]
    pub named_args: Map<String, Value>,
}

impl TxItem {
    pub fn new(command_name: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            positional_args: Vec::new(),
            named_args: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional_args.push(value.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named_args.insert(name.into(), value.into());
        self
    }

    /// `send_message(chat_id, text)`.
    pub fn send_message(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self::new("send_message").arg(chat_id).arg(text.into())
    }

    /// Second positional argument (after the chat id) as text, for `send_message`-shaped items.
    pub fn text(&self) -> Option<&str> {
        self.positional_args.get(1).and_then(Value::as_str)
    }
}
