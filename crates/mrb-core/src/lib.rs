//! Core domain + application logic for the media relay bot.
//!
//! This crate is framework-agnostic. Telegram and yt-dlp live behind ports
//! (traits) implemented in adapter crates.

pub mod classify;
pub mod config;
pub mod domain;
pub mod download;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod pipeline;
pub mod resolver;
pub mod scheduler;
pub mod security;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
