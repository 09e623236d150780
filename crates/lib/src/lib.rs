//! Gamemaster core library: routes Telegram conversations to game instances,
//! onboards unknown conversations and manages the fixed pool of instance slots.

pub mod config;
pub mod envelope;
pub mod games;
pub mod instance;
pub mod manager;
pub mod master;
pub mod platform;
pub mod queues;
pub mod router;
pub mod runtime;
pub mod session;
pub mod worker;
