//! Telegram channel: long-poll getUpdates into the inbound queue, Bot API calls for outbound commands.

use super::update::Update;
use super::PlatformError;
use crate::config::TelegramConfig;
use crate::envelope::{Payload, RouteBy, RxItem, RxKind};
use crate::queues::Inbox;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram connector. Holds the token; one instance serves both directions.
pub struct TelegramChannel {
    token: String,
    api_base: String,
    long_poll_timeout: u64,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: String, config: &TelegramConfig) -> Self {
        Self {
            token,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            long_poll_timeout: config.long_poll_timeout_secs,
            client: reqwest::Client::new(),
        }
    }

    /// POST a Bot API method with a JSON body. Returns the `result` field.
    pub async fn call(&self, method: &str, body: &Map<String, Value>) -> Result<Value, PlatformError> {
        let url = format!("{}/bot{}/{}", self.api_base, self.token, method);
        let res = self.client.post(&url).json(body).send().await?;
        let status = res.status();
        let text = res.text().await?;
        match serde_json::from_str::<ApiResponse>(&text) {
            Ok(data) if data.ok => Ok(data.result),
            Ok(data) => Err(PlatformError::Api {
                method: method.to_string(),
                description: data
                    .description
                    .unwrap_or_else(|| format!("ok: false ({})", status)),
            }),
            Err(_) => Err(PlatformError::Api {
                method: method.to_string(),
                description: format!("{} {}", status, text),
            }),
        }
    }

    /// Call getUpdates (long poll). Returns (raw updates, next_offset).
    async fn get_updates(&self, offset: Option<i64>) -> Result<(Vec<Value>, Option<i64>), PlatformError> {
        let mut body = Map::new();
        body.insert("timeout".into(), json!(self.long_poll_timeout));
        body.insert("allowed_updates".into(), json!(["message", "callback_query"]));
        if let Some(off) = offset {
            body.insert("offset".into(), json!(off));
        }
        let result = self.call("getUpdates", &body).await?;
        let updates = match result {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        let next_offset = updates
            .iter()
            .filter_map(|u| u.get("update_id").and_then(Value::as_i64))
            .max()
            .map(|id| id + 1);
        Ok((updates, next_offset.or(offset)))
    }

    /// Start the getUpdates loop, feeding `inbox` until `stop` is set. Returns a handle to await on shutdown.
    pub fn start_inbound(self: Arc<Self>, inbox: Inbox, stop: CancellationToken) -> JoinHandle<()> {
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, inbox, stop).await;
        })
    }
}

async fn run_get_updates_loop(channel: Arc<TelegramChannel>, inbox: Inbox, stop: CancellationToken) {
    let mut offset: Option<i64> = None;
    while !stop.is_cancelled() {
        let polled = tokio::select! {
            r = channel.get_updates(offset) => r,
            _ = stop.cancelled() => break,
        };
        match polled {
            Ok((updates, next)) => {
                offset = next;
                for raw in updates {
                    let Some(item) = to_rx_item(raw) else {
                        continue;
                    };
                    if inbox.put(item).is_err() {
                        log::debug!("telegram: inbound queue closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("telegram getUpdates error: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                    _ = stop.cancelled() => break,
                }
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

/// Turn one raw update into an inbound item, or `None` for updates the bot does not handle.
///
/// Messages and callbacks are routed by chat and user. `/join CODE` is additionally routed
/// by game code so it reaches the game that owns the code rather than the sender's chat.
pub fn to_rx_item(raw: Value) -> Option<RxItem> {
    let update: Update = match serde_json::from_value(raw.clone()) {
        Ok(u) => u,
        Err(e) => {
            log::debug!("telegram: unreadable update skipped: {}", e);
            return None;
        }
    };
    let chat = update.chat_id()?;
    let user = update.user_id();

    let (kind, game_code) = if update.callback_query.is_some() {
        (RxKind::Callback, None)
    } else {
        let text = update.message.as_ref()?.text.as_deref()?.trim();
        if text.starts_with('/') {
            (RxKind::Command, join_code(text))
        } else {
            (RxKind::Text, None)
        }
    };

    let mut item = RxItem::from_conversation(kind, chat, user.unwrap_or_default(), Payload::with_update(raw));
    if user.is_none() {
        item.user_id = None;
        item.route_by = RouteBy::CHAT;
    }
    Some(match game_code {
        Some(code) => item.with_game_code(code),
        None => item,
    })
}

/// Code argument of `/join CODE` (also `/join@bot CODE`), uppercased.
fn join_code(text: &str) -> Option<String> {
    let mut words = text.split_whitespace();
    let command = words.next()?.split('@').next()?;
    if command != "/join" {
        return None;
    }
    words.next().map(str::to_uppercase)
}
