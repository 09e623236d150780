//! Onboarding sessions held by the master instance, one per unmatched conversation.
//!
//! A session is driven one event at a time. Inside a single `advance` call the state machine
//! keeps moving until it reaches a state that needs the next external event, then yields.
//! It never blocks and never spawns work: creating a game instance is requested from the
//! caller through [`Advance::CreateInstance`].

use crate::envelope::{ChatId, SlotId, TxItem, UserId};
use crate::games::{Game, GAMES};
use crate::platform::update::{CallbackQuery, Update};
use crate::queues::Outbox;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const WELCOME_TEXT: &str = "Welcome ! I am the Game Master !\nWhat game you would like to play ?";
pub const FAREWELL_TEXT: &str = "Timeout! Bye Bye !!";

/// Why a session ended up in the `Error` state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("expected a message update")]
    MissingUpdate,

    #[error("expected a callback query")]
    MissingCallback,

    #[error("no game selected")]
    NoGameSelected,

    #[error("game instance creation failed: {0}")]
    InstanceCreation(String),
}

/// Input to one `advance` call.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Inbound platform update from the user.
    Update(Update),
    /// Inbound item that carried no usable update.
    Malformed,
    /// The manager created the requested game instance.
    InstanceCreated(SlotId),
    InstanceFailed(String),
}

/// Where the machine stopped after an `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Waiting for the next user event.
    Waiting,
    /// Waiting for the caller to create an instance of this game and report back.
    CreateInstance(&'static Game),
    /// Reached `Exit`: the user was handed to a game instance.
    Finished,
    /// Reached `Error`.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectGameState {
    FirstContact,
    GameOfferResponse,
    GameSelected,
    CreateGameInstance,
    GameInstanceCreated,
    RedirectUser,
    Exit,
    Error,
}

/// Fields every kind of session shares.
pub struct SessionCore {
    pub with_chat: Option<ChatId>,
    pub with_user: Option<UserId>,
    output: Outbox,
}

impl SessionCore {
    fn say(&self, text: impl Into<String>) {
        if let Some(chat) = self.with_chat {
            self.output.put(TxItem::send_message(chat, text));
        }
    }
}

/// Per-kind state machine payload.
pub enum SessionKind {
    SelectGame(SelectGame),
}

pub struct Session {
    alive: Instant,
    core: SessionCore,
    kind: SessionKind,
}

impl Session {
    /// New game-selection session, starting at `FirstContact`.
    pub fn select_game(output: Outbox, now: Instant) -> Self {
        Self {
            alive: now,
            core: SessionCore {
                with_chat: None,
                with_user: None,
                output,
            },
            kind: SessionKind::SelectGame(SelectGame::default()),
        }
    }

    pub fn advance(&mut self, event: SessionEvent, now: Instant) -> Advance {
        self.alive = now;
        match &mut self.kind {
            SessionKind::SelectGame(machine) => machine.advance(event, &mut self.core),
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.alive)
    }

    pub fn is_terminal(&self) -> bool {
        match &self.kind {
            SessionKind::SelectGame(m) => matches!(m.state, SelectGameState::Exit | SelectGameState::Error),
        }
    }

    /// Say goodbye. The caller discards the session afterwards.
    pub fn end(&mut self) {
        self.core.say(FAREWELL_TEXT);
    }

    pub fn with_chat(&self) -> Option<ChatId> {
        self.core.with_chat
    }

    pub fn with_user(&self) -> Option<UserId> {
        self.core.with_user
    }

    pub fn state(&self) -> SelectGameState {
        match &self.kind {
            SessionKind::SelectGame(m) => m.state,
        }
    }
}

/// Offer the game catalogue, take the pick, ask for an instance, redirect the user.
#[derive(Debug)]
pub struct SelectGame {
    state: SelectGameState,
    selected: Option<usize>,
    instance: Option<SlotId>,
    error: Option<SessionError>,
}

impl Default for SelectGame {
    fn default() -> Self {
        Self {
            state: SelectGameState::FirstContact,
            selected: None,
            instance: None,
            error: None,
        }
    }
}

impl SelectGame {
    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    fn fail(&mut self, error: SessionError) -> Advance {
        log::error!("select-game session entered error state: {}", error);
        self.state = SelectGameState::Error;
        self.error = Some(error);
        Advance::Failed
    }

    fn advance(&mut self, event: SessionEvent, core: &mut SessionCore) -> Advance {
        let mut event = Some(event);
        loop {
            match self.state {
                SelectGameState::FirstContact => {
                    let message = match event.take() {
                        Some(SessionEvent::Update(update)) => update.message,
                        _ => None,
                    };
                    let Some(message) = message else {
                        return self.fail(SessionError::MissingUpdate);
                    };
                    core.output.put(
                        TxItem::send_message(message.chat.id, WELCOME_TEXT)
                            .named("reply_markup", games_keyboard()),
                    );
                    core.with_chat = Some(message.chat.id);
                    core.with_user = message.from.map(|u| u.id);
                    self.state = SelectGameState::GameOfferResponse;
                    return Advance::Waiting;
                }
                SelectGameState::GameOfferResponse => {
                    let query = match event.take() {
                        Some(SessionEvent::Update(update)) => update.callback_query,
                        _ => None,
                    };
                    let Some(query) = query else {
                        return self.fail(SessionError::MissingCallback);
                    };
                    // Callback queries must always be answered.
                    core.output
                        .put(TxItem::new("answer_callback_query").arg(query.id.clone()));
                    let Some(index) = selection(&query) else {
                        log::debug!("ignoring game selection {:?}", query.data);
                        return Advance::Waiting;
                    };
                    if let Some(message) = &query.message {
                        core.output.put(
                            TxItem::new("edit_message_reply_markup")
                                .named("chat_id", message.chat.id)
                                .named("message_id", message.message_id)
                                .named("reply_markup", Value::Null),
                        );
                    }
                    self.selected = Some(index);
                    self.state = SelectGameState::GameSelected;
                }
                SelectGameState::GameSelected => {
                    let Some(game) = self.selected.and_then(|i| GAMES.get(i)) else {
                        return self.fail(SessionError::NoGameSelected);
                    };
                    core.say(format!("Great ! You have selected {}", game.name));
                    self.state = SelectGameState::CreateGameInstance;
                }
                SelectGameState::CreateGameInstance => {
                    let Some(game) = self.selected.and_then(|i| GAMES.get(i)) else {
                        return self.fail(SessionError::NoGameSelected);
                    };
                    match event.take() {
                        None => {
                            core.say(format!("Creating new game instance for {}", game.name));
                            return Advance::CreateInstance(game);
                        }
                        Some(SessionEvent::InstanceCreated(slot_id)) => {
                            self.instance = Some(slot_id);
                            self.state = SelectGameState::GameInstanceCreated;
                        }
                        Some(SessionEvent::InstanceFailed(reason)) => {
                            return self.fail(SessionError::InstanceCreation(reason));
                        }
                        Some(_) => {
                            log::debug!("user event while waiting for instance creation, ignored");
                            return Advance::CreateInstance(game);
                        }
                    }
                }
                SelectGameState::GameInstanceCreated => {
                    log::info!(
                        "chat {:?} handed to game instance {:?}",
                        core.with_chat,
                        self.instance
                    );
                    self.state = SelectGameState::RedirectUser;
                }
                SelectGameState::RedirectUser => {
                    if let Some(game) = self.selected.and_then(|i| GAMES.get(i)) {
                        core.say(format!("Your {} game is ready !", game.name));
                    }
                    self.state = SelectGameState::Exit;
                }
                SelectGameState::Exit => return Advance::Finished,
                SelectGameState::Error => return Advance::Failed,
            }
        }
    }
}

/// Valid game index from callback data; anything else (missing, empty, not a number, out of range) is `None`.
fn selection(query: &CallbackQuery) -> Option<usize> {
    let index: usize = query.data.as_deref()?.trim().parse().ok()?;
    (index < GAMES.len()).then_some(index)
}

/// One button per game, callback data is the game index.
fn games_keyboard() -> Value {
    let rows: Vec<Value> = GAMES
        .iter()
        .map(|game| json!([{ "text": game.name, "callback_data": game.id.to_string() }]))
        .collect();
    json!({ "inline_keyboard": rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TxItem;
    use crate::queues::{self, OutboundReceiver};

    fn first_contact(chat: i64, user: i64) -> SessionEvent {
        SessionEvent::Update(
            serde_json::from_value(json!({
                "update_id": 1,
                "message": {
                    "message_id": 10,
                    "chat": { "id": chat },
                    "from": { "id": user, "first_name": "Ana" },
                    "text": "hi"
                }
            }))
            .expect("update"),
        )
    }

    fn callback(chat: i64, user: i64, data: Option<&str>) -> SessionEvent {
        let mut query = json!({
            "id": "cb-1",
            "from": { "id": user, "first_name": "Ana" },
            "message": { "message_id": 11, "chat": { "id": chat } }
        });
        if let Some(d) = data {
            query["data"] = json!(d);
        }
        SessionEvent::Update(
            serde_json::from_value(json!({ "update_id": 2, "callback_query": query }))
                .expect("update"),
        )
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<TxItem> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    fn new_session() -> (Session, OutboundReceiver) {
        let (outbox, rx) = queues::outbound();
        (Session::select_game(outbox, Instant::now()), rx)
    }

    #[test]
    fn first_contact_offers_four_games() {
        let (mut session, mut rx) = new_session();
        assert_eq!(session.advance(first_contact(100, 42), Instant::now()), Advance::Waiting);
        assert_eq!(session.state(), SelectGameState::GameOfferResponse);
        assert_eq!(session.with_chat(), Some(100));
        assert_eq!(session.with_user(), Some(42));

        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].command_name, "send_message");
        assert_eq!(out[0].positional_args[0], json!(100));
        let buttons = out[0].named_args["reply_markup"]["inline_keyboard"]
            .as_array()
            .expect("keyboard rows");
        let names: Vec<&str> = buttons
            .iter()
            .map(|row| row[0]["text"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["Guess the picture", "Dominos", "Laser fights", "Sleeper"]);
    }

    #[test]
    fn selecting_dominos_runs_through_to_instance_request() {
        let (mut session, mut rx) = new_session();
        session.advance(first_contact(100, 42), Instant::now());
        drain(&mut rx);

        let outcome = session.advance(callback(100, 42, Some("1")), Instant::now());
        assert_eq!(outcome, Advance::CreateInstance(&GAMES[1]));
        assert_eq!(session.state(), SelectGameState::CreateGameInstance);

        let out = drain(&mut rx);
        let names: Vec<&str> = out.iter().map(|t| t.command_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "answer_callback_query",
                "edit_message_reply_markup",
                "send_message",
                "send_message"
            ]
        );
        assert_eq!(out[0].positional_args, vec![json!("cb-1")]);
        assert_eq!(out[1].named_args["reply_markup"], Value::Null);
        assert_eq!(out[2].text(), Some("Great ! You have selected Dominos"));
        assert_eq!(out[3].text(), Some("Creating new game instance for Dominos"));
    }

    #[test]
    fn out_of_range_selection_is_ignored() {
        let (mut session, mut rx) = new_session();
        session.advance(first_contact(100, 42), Instant::now());
        drain(&mut rx);

        for data in [Some("99"), Some(""), None, Some("dominos")] {
            assert_eq!(session.advance(callback(100, 42, data), Instant::now()), Advance::Waiting);
            let out = drain(&mut rx);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].command_name, "answer_callback_query");
            assert_eq!(session.state(), SelectGameState::GameOfferResponse);
        }
    }

    #[test]
    fn instance_created_redirects_and_exits() {
        let (mut session, mut rx) = new_session();
        session.advance(first_contact(100, 42), Instant::now());
        session.advance(callback(100, 42, Some("2")), Instant::now());
        drain(&mut rx);

        assert_eq!(
            session.advance(SessionEvent::InstanceCreated(3), Instant::now()),
            Advance::Finished
        );
        assert_eq!(session.state(), SelectGameState::Exit);
        assert!(session.is_terminal());
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), Some("Your Laser fights game is ready !"));
    }

    #[test]
    fn instance_failure_is_terminal_error() {
        let (mut session, _rx) = new_session();
        session.advance(first_contact(100, 42), Instant::now());
        session.advance(callback(100, 42, Some("0")), Instant::now());
        assert_eq!(
            session.advance(SessionEvent::InstanceFailed("full".into()), Instant::now()),
            Advance::Failed
        );
        assert_eq!(session.state(), SelectGameState::Error);
    }

    #[test]
    fn missing_input_moves_to_error() {
        let (mut session, mut rx) = new_session();
        assert_eq!(session.advance(SessionEvent::Malformed, Instant::now()), Advance::Failed);
        assert_eq!(session.state(), SelectGameState::Error);
        assert!(drain(&mut rx).is_empty());

        let (mut session, _rx) = new_session();
        session.advance(first_contact(100, 42), Instant::now());
        // A plain text message where a button press is expected.
        assert_eq!(session.advance(first_contact(100, 42), Instant::now()), Advance::Failed);
        match &session.kind {
            SessionKind::SelectGame(m) => assert_eq!(m.error(), Some(&SessionError::MissingCallback)),
        }
    }

    #[test]
    fn end_sends_farewell_to_chat() {
        let (mut session, mut rx) = new_session();
        session.advance(first_contact(100, 42), Instant::now());
        drain(&mut rx);
        session.end();
        let out = drain(&mut rx);
        assert_eq!(out, vec![TxItem::send_message(100, FAREWELL_TEXT)]);
    }
}
