//! Verified, memory-bounded local view of a multi-relay Nostr event log.
//!
//! This crate provides the client core: event authentication, relay URL
//! normalization, filters, the local store with replaceable/addressable
//! reconciliation, the decryption cache, the subscription multiplexer and
//! the trim service. Relay transport lives outside; it feeds raw frames
//! into a [`ViewContext`] and carries out the REQ/CLOSE requests the
//! multiplexer issues through [`RelayTransport`].

pub mod config;
pub mod context;
pub mod decrypt;
pub mod error;
pub mod event;
pub mod filter;
pub mod message;
pub mod relay;
pub mod store;
pub mod subscription;
pub mod trim;
pub mod verify;

// Re-export commonly used types
pub use config::CoreConfig;
pub use context::{Handled, ViewContext};
pub use decrypt::{DecryptionCache, Decryptor, EncryptionScheme, KeysDecryptor};
pub use error::{
    ConfigError, DecryptError, FilterError, MessageError, SubscriptionError, TransportError,
};
pub use event::{Event, EventAddress, EventTemplate, KindClass, KnownKind};
pub use filter::Filter;
pub use message::{ClientMessage, RelayMessage};
pub use relay::{normalize as normalize_relay_url, RelayNormalizer, RelayUrl};
pub use store::{InsertOutcome, LocalStore, Note, NoteKey, NoteState, StoreEvent, StoreStats};
pub use subscription::{GroupState, Multiplexer, RelayFilter, RelayTransport};
pub use trim::{RetentionContext, TrimOutcome, TrimReport, TrimService};
pub use verify::{verify, VerifyMetrics};

// Re-export nostr-sdk for convenience
pub use nostr_sdk;

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
