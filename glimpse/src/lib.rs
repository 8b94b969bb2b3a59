//! `Glimpse`: client-side message sync core for ephemeral media chat.

pub mod backend;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod ephemeral;
pub mod lifecycle;
pub mod logging;
pub mod loopback;
pub mod merge;
pub mod outbox;
pub mod storage;
pub mod sync;
pub mod window;
