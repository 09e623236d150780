//! Integration test: run the core (router, manager, master instance) without Telegram.
//! Raw updates go in through the same conversion the long-poll loop uses; outbound
//! commands are read straight off the outbound queue.

use gamemaster::config::RuntimeConfig;
use gamemaster::envelope::{RouteKey, TxItem};
use gamemaster::platform::to_rx_item;
use gamemaster::queues::{self, OutboundReceiver};
use gamemaster::runtime::{default_registry, Runtime};
use gamemaster::session::{FAREWELL_TEXT, WELCOME_TEXT};
use serde_json::{json, Value};
use std::time::Duration;

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        pool_capacity: 2,
        poll_interval_ms: 10,
        stop_timeout_ms: 200,
        ..RuntimeConfig::default()
    }
}

fn text(update_id: i64, chat: i64, user: i64, text: &str) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "chat": { "id": chat },
            "from": { "id": user, "first_name": format!("P{}", user) },
            "text": text
        }
    })
}

fn button(update_id: i64, chat: i64, user: i64, data: &str) -> Value {
    json!({
        "update_id": update_id,
        "callback_query": {
            "id": format!("cb{}", update_id),
            "from": { "id": user, "first_name": format!("P{}", user) },
            "message": { "message_id": 1, "chat": { "id": chat } },
            "data": data
        }
    })
}

/// Collect outbound items until one satisfies `done`, or fail after `within`.
async fn collect_until(
    rx: &mut OutboundReceiver,
    within: Duration,
    done: impl Fn(&TxItem) -> bool,
) -> Vec<TxItem> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(item)) => {
                let finished = done(&item);
                seen.push(item);
                if finished {
                    return seen;
                }
            }
            Ok(None) => panic!("outbound queue closed; got {:?}", seen),
            Err(_) => panic!("timed out; got {:?}", seen),
        }
    }
}

fn has_text(items: &[TxItem], expected: &str) -> bool {
    items.iter().any(|i| i.text() == Some(expected))
}

#[tokio::test]
async fn new_chat_is_onboarded_into_a_lobby() {
    let (outbox, mut rx) = queues::outbound();
    let core = Runtime::start(fast_config(), default_registry(), outbox);
    let inbox = core.inbox();
    let wait = Duration::from_secs(5);

    inbox
        .put(to_rx_item(text(1, 100, 1, "hi")).expect("item"))
        .expect("put");
    let welcome = collect_until(&mut rx, wait, |i| i.command_name == "send_message").await;
    let offer = welcome.last().expect("welcome");
    assert_eq!(offer.text(), Some(WELCOME_TEXT));
    assert!(offer.named_args.contains_key("reply_markup"));

    inbox
        .put(to_rx_item(button(2, 100, 1, "1")).expect("item"))
        .expect("put");
    let mut out = collect_until(&mut rx, wait, |i| {
        i.text() == Some("Your Dominos game is ready !")
    })
    .await;
    assert_eq!(out[0].command_name, "answer_callback_query");
    assert!(has_text(&out, "Great ! You have selected Dominos"));
    assert!(has_text(&out, "Creating new game instance for Dominos"));
    if !out
        .iter()
        .any(|i| i.text().map_or(false, |t| t.contains("game room is open")))
    {
        out.extend(
            collect_until(&mut rx, wait, |i| {
                i.text().map_or(false, |t| t.contains("game room is open"))
            })
            .await,
        );
    }

    let manager = core.manager();
    assert_eq!(manager.lookup(&RouteKey::Chat(100)).await, vec![0]);
    assert_eq!(manager.lookup(&RouteKey::User(1)).await, vec![0]);
    let code = manager
        .find_by(0)
        .await
        .and_then(|f| f.game_code)
        .expect("lobby claims a game code");
    assert!(out
        .iter()
        .any(|i| i.text().map_or(false, |t| t.ends_with(&format!("/join {}", code)))));

    // The chat now belongs to the lobby, not to onboarding.
    inbox
        .put(to_rx_item(text(3, 100, 1, "/code")).expect("item"))
        .expect("put");
    let reply = collect_until(&mut rx, wait, |i| {
        i.text().map_or(false, |t| t.starts_with("Game code:"))
    })
    .await;
    assert_eq!(
        reply.last().and_then(TxItem::text),
        Some(format!("Game code: {}", code).as_str())
    );

    // A second chat joins by code.
    inbox
        .put(to_rx_item(text(4, 200, 2, &format!("/join {}", code.to_lowercase()))).expect("item"))
        .expect("put");
    collect_until(&mut rx, wait, |i| i.text() == Some("P2 joined the Dominos game")).await;
    assert_eq!(manager.lookup(&RouteKey::Chat(200)).await, vec![0]);

    let manager = manager.clone();
    tokio::time::timeout(Duration::from_secs(5), core.shutdown())
        .await
        .expect("shutdown completes");
    assert!(manager.occupied().await.is_empty());
}

#[tokio::test]
async fn idle_onboarding_session_says_goodbye() {
    let (outbox, mut rx) = queues::outbound();
    let config = RuntimeConfig {
        session_timeout_secs: 1,
        ..fast_config()
    };
    let core = Runtime::start(config, default_registry(), outbox);

    core.inbox()
        .put(to_rx_item(text(1, 300, 3, "hello")).expect("item"))
        .expect("put");
    let out = collect_until(&mut rx, Duration::from_secs(5), |i| i.text() == Some(FAREWELL_TEXT)).await;
    assert!(has_text(&out, WELCOME_TEXT));
    let farewell = out.last().expect("farewell");
    assert_eq!(farewell, &TxItem::send_message(300, FAREWELL_TEXT));
    assert!(core.manager().occupied().await.is_empty());

    core.shutdown().await;
}
