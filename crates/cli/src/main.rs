use anyhow::Context;
use clap::{Parser, Subcommand};
use gamemaster::platform::{self, TelegramChannel, REQUIRED_COMMANDS};
use gamemaster::queues;
use gamemaster::runtime::{self, Runtime};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "gamemaster")]
#[command(about = "Game Master bot for Telegram", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the bot: long-poll Telegram, route conversations, manage game instances until Ctrl+C.
    Run {
        /// Config file path (default: GAMEMASTER_CONFIG_PATH or ~/.gamemaster/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("gamemaster {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Run { config }) => {
            if let Err(e) = run(config).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = gamemaster::config::load_config(config_path)?;
    log::info!("loaded config from {}", path.display());
    let token = gamemaster::config::resolve_telegram_token(&config).context(
        "telegram bot token not configured (set telegram.botToken or TELEGRAM_BOT_TOKEN)",
    )?;

    let telegram = Arc::new(TelegramChannel::new(token, &config.telegram));
    let commands = platform::telegram_commands(telegram.clone());
    commands
        .validate(&REQUIRED_COMMANDS)
        .context("checking outbound command handlers")?;
    log::info!("outbound commands: {}", commands.names().join(", "));

    let (outbox, outbound_rx) = queues::outbound();
    let core = Runtime::start(config.runtime.clone(), runtime::default_registry(), outbox);

    let platform_stop = CancellationToken::new();
    let inbound = telegram.start_inbound(core.inbox(), platform_stop.clone());
    let outbound = tokio::spawn(platform::run_outbound(
        commands,
        outbound_rx,
        platform_stop.clone(),
        config.runtime.poll_interval(),
    ));

    shutdown_signal().await;
    log::info!("shutdown requested");

    core.shutdown().await;
    platform_stop.cancel();
    for (name, mut task) in [("inbound", inbound), ("outbound", outbound)] {
        if tokio::time::timeout(config.runtime.stop_timeout(), &mut task)
            .await
            .is_err()
        {
            log::error!("telegram {} loop did not stop in time, aborting", name);
            task.abort();
        }
    }
    log::info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
