//! Messenger abstractions (Telegram today, behind ports).

pub mod port;
pub mod throttled;
pub mod types;
