//! Outbound commands: a registry mapping `TxItem::command_name` to a typed handler.
//!
//! Instances name platform operations by string so that game code never needs a closed list
//! of operations. The registry is checked against [`REQUIRED_COMMANDS`] at startup; a name
//! missing at runtime is reported as [`PlatformError::UnknownCommand`] and the item is dropped.

use super::telegram::TelegramChannel;
use super::PlatformError;
use crate::envelope::TxItem;
use crate::queues::OutboundReceiver;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Commands the core itself emits.
pub const REQUIRED_COMMANDS: [&str; 3] = [
    "send_message",
    "answer_callback_query",
    "edit_message_reply_markup",
];

/// Executes one named outbound command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), PlatformError>;
}

/// Argument layout of one Bot API method.
#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    pub command: &'static str,
    pub method: &'static str,
    /// Parameter names positional args bind to, in order. All are required.
    pub positional: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl MethodSpec {
    /// JSON request body. Null named args are left out.
    pub fn build_body(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<Map<String, Value>, PlatformError> {
        let bad = |reason: String| PlatformError::BadArguments {
            command: self.command.to_string(),
            reason,
        };
        if args.len() > self.positional.len() {
            return Err(bad(format!(
                "expected at most {} positional arguments, got {}",
                self.positional.len(),
                args.len()
            )));
        }
        let mut body = Map::new();
        for (name, value) in self.positional.iter().zip(args) {
            body.insert((*name).to_string(), value.clone());
        }
        for (name, value) in kwargs {
            if !self.positional.contains(&name.as_str()) && !self.optional.contains(&name.as_str()) {
                return Err(bad(format!("unexpected argument {}", name)));
            }
            if body.contains_key(name) {
                return Err(bad(format!("{} given twice", name)));
            }
            if !value.is_null() {
                body.insert(name.clone(), value.clone());
            }
        }
        if let Some(missing) = self.positional.iter().find(|n| !body.contains_key(**n)) {
            return Err(bad(format!("missing argument {}", missing)));
        }
        Ok(body)
    }
}

pub const SEND_MESSAGE: MethodSpec = MethodSpec {
    command: "send_message",
    method: "sendMessage",
    positional: &["chat_id", "text"],
    optional: &["reply_markup", "parse_mode", "disable_notification", "reply_to_message_id"],
};

pub const ANSWER_CALLBACK_QUERY: MethodSpec = MethodSpec {
    command: "answer_callback_query",
    method: "answerCallbackQuery",
    positional: &["callback_query_id"],
    optional: &["text", "show_alert", "url", "cache_time"],
};

pub const EDIT_MESSAGE_REPLY_MARKUP: MethodSpec = MethodSpec {
    command: "edit_message_reply_markup",
    method: "editMessageReplyMarkup",
    positional: &[],
    optional: &["chat_id", "message_id", "inline_message_id", "reply_markup"],
};

/// A Bot API method bound to a channel.
pub struct BotMethod {
    api: Arc<TelegramChannel>,
    spec: MethodSpec,
}

impl BotMethod {
    pub fn new(api: Arc<TelegramChannel>, spec: MethodSpec) -> Self {
        Self { api, spec }
    }
}

#[async_trait]
impl CommandHandler for BotMethod {
    async fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), PlatformError> {
        let body = self.spec.build_body(args, kwargs)?;
        self.api.call(self.spec.method, &body).await?;
        Ok(())
    }
}

/// Registry of command names to handlers.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            log::debug!("outbound command {} re-registered", name);
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fails listing every name in `required` that has no handler.
    pub fn validate(&self, required: &[&str]) -> Result<(), PlatformError> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|n| !self.handlers.contains_key(*n))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PlatformError::NotConfigured(missing.join(", ")))
        }
    }

    pub async fn execute(&self, item: &TxItem) -> Result<(), PlatformError> {
        let handler = self
            .handlers
            .get(&item.command_name)
            .ok_or_else(|| PlatformError::UnknownCommand(item.command_name.clone()))?;
        handler.call(&item.positional_args, &item.named_args).await
    }
}

/// Registry with the Bot API methods the core emits.
pub fn telegram_commands(api: Arc<TelegramChannel>) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    for spec in [SEND_MESSAGE, ANSWER_CALLBACK_QUERY, EDIT_MESSAGE_REPLY_MARKUP] {
        registry.register(spec.command, Arc::new(BotMethod::new(api.clone(), spec)));
    }
    registry
}

/// Execute outbound items until `stop` is set. Failures are logged, never retried.
pub async fn run_outbound(registry: CommandRegistry, mut items: OutboundReceiver, stop: CancellationToken, poll: Duration) {
    log::info!("outbound executor started");
    while !stop.is_cancelled() {
        match tokio::time::timeout(poll, items.recv()).await {
            Ok(Some(item)) => match registry.execute(&item).await {
                Ok(()) => {}
                Err(e @ PlatformError::UnknownCommand(_)) => log::error!("{}", e),
                Err(e) => log::warn!("outbound {} failed: {}", item.command_name, e),
            },
            Ok(None) => break,
            Err(_) => {}
        }
    }
    log::info!("outbound executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Vec<Value>, Map<String, Value>)>>,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), PlatformError> {
            self.calls.lock().expect("lock").push((args.to_vec(), kwargs.clone()));
            Ok(())
        }
    }

    fn kwargs(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn send_message_body_binds_positionals() {
        let body = SEND_MESSAGE
            .build_body(&[json!(5), json!("hi")], &kwargs(json!({ "reply_markup": { "k": 1 } })))
            .expect("body");
        assert_eq!(
            Value::Object(body),
            json!({ "chat_id": 5, "text": "hi", "reply_markup": { "k": 1 } })
        );
    }

    #[test]
    fn null_named_args_are_omitted() {
        let body = EDIT_MESSAGE_REPLY_MARKUP
            .build_body(
                &[],
                &kwargs(json!({ "chat_id": 1, "message_id": 2, "reply_markup": null })),
            )
            .expect("body");
        assert_eq!(Value::Object(body), json!({ "chat_id": 1, "message_id": 2 }));
    }

    #[test]
    fn bad_arguments_are_reported() {
        let missing = SEND_MESSAGE.build_body(&[json!(5)], &Map::new());
        assert!(matches!(missing, Err(PlatformError::BadArguments { .. })));

        let extra = ANSWER_CALLBACK_QUERY.build_body(&[json!("q"), json!("x")], &Map::new());
        assert!(matches!(extra, Err(PlatformError::BadArguments { .. })));

        let unknown = SEND_MESSAGE.build_body(&[json!(5), json!("hi")], &kwargs(json!({ "colour": "red" })));
        assert!(matches!(unknown, Err(PlatformError::BadArguments { .. })));

        let twice = SEND_MESSAGE.build_body(&[json!(5), json!("hi")], &kwargs(json!({ "text": "again" })));
        assert!(matches!(twice, Err(PlatformError::BadArguments { .. })));
    }

    #[test]
    fn validate_lists_missing_names() {
        let mut registry = CommandRegistry::new();
        registry.register("send_message", Arc::new(Recorder::default()));
        match registry.validate(&REQUIRED_COMMANDS) {
            Err(PlatformError::NotConfigured(missing)) => {
                assert_eq!(missing, "answer_callback_query, edit_message_reply_markup")
            }
            other => panic!("unexpected {:?}", other),
        }
        for name in REQUIRED_COMMANDS {
            registry.register(name, Arc::new(Recorder::default()));
        }
        assert!(registry.validate(&REQUIRED_COMMANDS).is_ok());
        assert_eq!(registry.names().len(), 3);
    }

    #[tokio::test]
    async fn execute_dispatches_by_name() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = CommandRegistry::new();
        registry.register("send_message", recorder.clone());

        registry
            .execute(&TxItem::send_message(7, "hello").named("parse_mode", "HTML"))
            .await
            .expect("execute");
        let calls = recorder.calls.lock().expect("lock").clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec![json!(7), json!("hello")]);
        assert_eq!(calls[0].1.get("parse_mode"), Some(&json!("HTML")));

        let err = registry.execute(&TxItem::new("launch_rocket")).await;
        assert!(matches!(err, Err(PlatformError::UnknownCommand(name)) if name == "launch_rocket"));
    }

    #[tokio::test]
    async fn outbound_loop_survives_unknown_commands() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = CommandRegistry::new();
        registry.register("send_message", recorder.clone());
        let (outbox, rx) = queues::outbound();
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_outbound(registry, rx, stop.clone(), Duration::from_millis(10)));

        outbox.put(TxItem::new("launch_rocket"));
        outbox.put(TxItem::send_message(1, "still here"));
        for _ in 0..100 {
            if !recorder.calls.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.calls.lock().expect("lock").len(), 1);

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop exits")
            .expect("join");
    }
}
