//! Chat-platform boundary: Telegram updates in, named Bot API calls out.

pub mod commands;
pub mod telegram;
pub mod update;

pub use commands::{run_outbound, telegram_commands, CommandHandler, CommandRegistry, REQUIRED_COMMANDS};
pub use telegram::{to_rx_item, TelegramChannel};

/// Errors from the platform boundary.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("unknown outbound command: {0}")]
    UnknownCommand(String),
    #[error("bad arguments for {command}: {reason}")]
    BadArguments { command: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{method} failed: {description}")]
    Api { method: String, description: String },
    #[error("outbound commands not configured: {0}")]
    NotConfigured(String),
}
