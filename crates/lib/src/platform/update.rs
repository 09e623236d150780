//! Telegram update payload, the subset the bot reads (getUpdates result item or webhook body).

use crate::envelope::{ChatId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    /// The bot message whose button was pressed; absent for very old messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Update {
    /// Conversation the update belongs to. For callbacks this is the chat of the pressed message.
    pub fn chat_id(&self) -> Option<ChatId> {
        if let Some(query) = &self.callback_query {
            return query.message.as_ref().map(|m| m.chat.id);
        }
        self.message.as_ref().map(|m| m.chat.id)
    }

    pub fn user_id(&self) -> Option<UserId> {
        if let Some(query) = &self.callback_query {
            return Some(query.from.id);
        }
        self.message.as_ref().and_then(|m| m.from.as_ref()).map(|u| u.id)
    }

    /// Parse an update carried in an item payload.
    pub fn from_payload(payload: &crate::envelope::Payload) -> Option<Update> {
        let raw = payload.update()?;
        match serde_json::from_value(raw.clone()) {
            Ok(update) => Some(update),
            Err(e) => {
                log::debug!("payload update does not parse: {}", e);
                None
            }
        }
    }
}
