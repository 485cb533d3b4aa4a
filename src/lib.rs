//! `nostr-view`: load a configuration, replay captured relay traffic through
//! the [`nostr_core`] view and report what it kept.

pub mod config;
pub mod replay;

pub use config::Config;
pub use replay::{replay, LoggingTransport, ReplayOptions, ReplaySummary};
