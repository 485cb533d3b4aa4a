//! Error types for the core.
//!
//! Boundary operations (verification, URL normalization, inserts) report
//! through `bool`/`Option`/outcome enums; these errors cover the places where
//! callers need to know why something was refused.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// No ids, authors, kinds, tags, time bounds or search.
    #[error("filter has no constraints")]
    Unconstrained,

    #[error("filter window is empty (since {since} > until {until})")]
    EmptyWindow { since: u64, until: u64 },

    #[error("tag filter key '{0}' must be '#' followed by a tag name")]
    BadTagKey(String),
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("relay message must be a non-empty array with a string label")]
    NotAnArray,

    #[error("{label} message is missing field {index}")]
    MissingField { label: String, index: usize },
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("invalid counterparty key: {0}")]
    BadCounterparty(String),

    #[error("decryption failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay {0} is not connected")]
    NotConnected(String),

    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("invalid filter for key '{key}': {source}")]
    InvalidFilter {
        key: String,
        #[source]
        source: FilterError,
    },

    #[error("multiplexer is shut down")]
    ShutDown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}
