//! Offline replay of captured relay traffic through a [`ViewContext`].
//!
//! Input is JSONL, one `{"relay": "...", "message": [...]}` record per line,
//! the way a transport would have received them.

use crate::config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use nostr_core::{
    ClientMessage, Filter, Handled, InsertOutcome, KeysDecryptor, RelayFilter, RelayTransport,
    RelayUrl, RetentionContext, StoreStats, TrimOutcome, TrimReport, TransportError, ViewContext,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Transport with no sockets: outbound requests are logged and counted.
#[derive(Debug, Default)]
pub struct LoggingTransport {
    reqs: AtomicUsize,
    closes: AtomicUsize,
}

impl LoggingTransport {
    pub fn reqs(&self) -> usize {
        self.reqs.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RelayTransport for LoggingTransport {
    async fn send_req(
        &self,
        relay: &RelayUrl,
        subscription_id: &str,
        filters: &[Filter],
    ) -> Result<(), TransportError> {
        self.reqs.fetch_add(1, Ordering::Relaxed);
        let message = ClientMessage::Req {
            sub_id: subscription_id.to_string(),
            filters: filters.to_vec(),
        };
        info!("-> {relay} {}", message.to_json());
        Ok(())
    }

    async fn send_close(&self, relay: &RelayUrl, subscription_id: &str) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::Relaxed);
        let message = ClientMessage::Close {
            sub_id: subscription_id.to_string(),
        };
        info!("-> {relay} {}", message.to_json());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    relay: String,
    message: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Clock used for retention decisions; defaults to the wall clock
    pub now: Option<u64>,
    pub skip_trim: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageCounts {
    pub added: usize,
    pub superseded: usize,
    pub duplicate: usize,
    pub rejected: usize,
    pub ephemeral: usize,
    pub deleted: usize,
    pub eose: usize,
    pub ok: usize,
    pub closed: usize,
    pub notice: usize,
    pub auth: usize,
    pub unknown: usize,
    pub malformed: usize,
}

impl MessageCounts {
    fn record(&mut self, handled: &Handled) {
        match handled {
            Handled::Event(InsertOutcome::Added) => self.added += 1,
            Handled::Event(InsertOutcome::Superseded) => self.superseded += 1,
            Handled::Event(InsertOutcome::Duplicate) => self.duplicate += 1,
            Handled::Event(InsertOutcome::Rejected) => self.rejected += 1,
            Handled::Event(InsertOutcome::Ephemeral) => self.ephemeral += 1,
            Handled::Event(InsertOutcome::Deleted) => self.deleted += 1,
            Handled::Eose { .. } => self.eose += 1,
            Handled::Ok { .. } => self.ok += 1,
            Handled::Closed => self.closed += 1,
            Handled::Notice => self.notice += 1,
            Handled::Auth => self.auth += 1,
            Handled::Unknown => self.unknown += 1,
            Handled::Malformed => self.malformed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub lines: usize,
    pub messages: MessageCounts,
    pub verified: u64,
    pub verify_failures: u64,
    pub decrypted: usize,
    pub reqs_sent: usize,
    pub closes_sent: usize,
    /// None when trimming was skipped
    pub trim: Option<TrimReport>,
    pub store: StoreStats,
}

/// Build a context from `config`, register its queries, feed every record
/// in `input` through it and trim once at the end.
pub async fn replay(config: &Config, input: &Path, options: &ReplayOptions) -> Result<ReplaySummary> {
    let transport = Arc::new(LoggingTransport::default());
    let mut context = ViewContext::new(config.core.clone(), transport.clone());
    if let Some(keys) = config.load_keys()? {
        info!("Decrypting as {}", keys.public_key());
        context = context.with_decryptor(Arc::new(KeysDecryptor::new(keys)));
    }

    register_queries(&context, config).await?;

    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open replay file: {}", input.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut line_count = 0;
    let mut messages = MessageCounts::default();
    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?
    {
        line_count += 1;
        if line.trim().is_empty() {
            continue;
        }
        let handled = match serde_json::from_str::<ReplayRecord>(&line) {
            Ok(record) => {
                context
                    .handle_relay_message(&record.relay, &record.message.to_string())
                    .await
            }
            Err(e) => {
                warn!("Line {line_count}: not a replay record: {e}");
                Handled::Malformed
            }
        };
        debug!("Line {line_count}: {handled:?}");
        messages.record(&handled);
    }

    let decrypted = decrypt_private_events(&context).await;

    let trim = if options.skip_trim {
        None
    } else {
        let now = options.now.unwrap_or_else(nostr_core::now_secs);
        let retention = RetentionContext::new(config.retention.accounts.iter().cloned(), now);
        match context.trim(&retention).await {
            TrimOutcome::Completed(report) => Some(report),
            TrimOutcome::AlreadyRunning => None,
        }
    };

    let (verified, verify_failures) = context.store().metrics().snapshot();
    let store = context.store().stats();
    context.shutdown().await;

    Ok(ReplaySummary {
        lines: line_count,
        messages,
        verified,
        verify_failures,
        decrypted,
        reqs_sent: transport.reqs(),
        closes_sent: transport.closes(),
        trim,
        store,
    })
}

async fn register_queries(context: &ViewContext, config: &Config) -> Result<()> {
    for query in &config.queries {
        let relays: Vec<RelayUrl> = query
            .relays
            .iter()
            .filter_map(|raw| context.normalize_relay(raw))
            .collect();
        context
            .subscriptions()
            .register(&query.group, &query.key, RelayFilter::fan_out(&relays, &query.filter))
            .await
            .with_context(|| format!("Failed to register query {}/{}", query.group, query.key))?;
    }
    Ok(())
}

async fn decrypt_private_events(context: &ViewContext) -> usize {
    let private = context
        .store()
        .scan(false, |event, _| event.known_kind().is_encrypted());
    let mut decrypted = 0;
    for event in private {
        if context.decrypted_view(&event).await.is_some() {
            decrypted += 1;
        }
    }
    decrypted
}
