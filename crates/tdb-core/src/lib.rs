//! Core domain + application logic for the Terabox relay bot.
//!
//! This crate is intentionally framework-agnostic. Telegram, the aria2 daemon and
//! ffmpeg live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod delivery;
pub mod domain;
pub mod download;
pub mod errors;
pub mod formatting;
pub mod links;
pub mod logging;
pub mod membership;
pub mod messaging;
pub mod pipeline;
pub mod segment;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
