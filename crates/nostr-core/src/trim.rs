//! Eviction service. Keeps the local view bounded.
//!
//! A trim runs its passes in a fixed order:
//! 1. direct messages older than the retention window (the latest message of
//!    each conversation is kept)
//! 2. replies, reactions, reposts, zaps and reports that do not involve a
//!    retained account and that nobody is observing
//! 3. superseded versions of replaceable/addressable events
//! 4. NIP-40 expired events
//!
//! Idle placeholders and stale deletion tombstones are dropped last.
//!
//! Candidates are collected under a short read lock; each removal is its own
//! critical section, and the task yields between removals so readers and
//! inserts interleave freely. Only one trim runs at a time.

use crate::event::{Event, KnownKind};
use crate::store::LocalStore;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Who and when a trim is relative to.
#[derive(Debug, Clone, Default)]
pub struct RetentionContext {
    /// Accounts whose own events and notifications are never trimmed
    pub accounts: HashSet<String>,
    /// Unix seconds
    pub now: u64,
}

impl RetentionContext {
    pub fn new(accounts: impl IntoIterator<Item = String>, now: u64) -> Self {
        Self {
            accounts: accounts.into_iter().collect(),
            now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrimReport {
    pub direct_messages: usize,
    pub replies_and_reactions: usize,
    pub superseded_versions: usize,
    pub expired: usize,
    pub placeholders: usize,
    /// Deletion requests forgotten; not counted in [`TrimReport::total`]
    pub tombstones: usize,
}

impl TrimReport {
    pub fn total(&self) -> usize {
        self.direct_messages
            + self.replies_and_reactions
            + self.superseded_versions
            + self.expired
            + self.placeholders
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimOutcome {
    Completed(TrimReport),
    /// Another trim was in flight; this request was a no-op
    AlreadyRunning,
}

/// Held while a trim is running. Dropping it releases the slot.
pub struct TrimGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for TrimGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Default age after which unmatched deletion requests are forgotten.
const DEFAULT_TOMBSTONE_RETENTION_SECS: u64 = 30 * 24 * 3600;

pub struct TrimService {
    store: Arc<LocalStore>,
    dm_retention_secs: u64,
    tombstone_retention_secs: u64,
    running: AtomicBool,
}

impl TrimService {
    pub fn new(store: Arc<LocalStore>, dm_retention_secs: u64) -> Self {
        Self {
            store,
            dm_retention_secs,
            tombstone_retention_secs: DEFAULT_TOMBSTONE_RETENTION_SECS,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_tombstone_retention(mut self, secs: u64) -> Self {
        self.tombstone_retention_secs = secs;
        self
    }

    /// Claim the single trim slot, if free.
    pub fn try_begin(&self) -> Option<TrimGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TrimGuard {
                running: &self.running,
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn trim(&self, retention: &RetentionContext) -> TrimOutcome {
        let Some(_guard) = self.try_begin() else {
            debug!("Trim already running, skipping");
            return TrimOutcome::AlreadyRunning;
        };

        let direct_messages = self.remove_all(self.old_direct_messages(retention)).await;
        let replies_and_reactions = self.remove_all(self.unretained_replies(retention)).await;
        let superseded_versions = self.remove_all(self.store.superseded_ids()).await;
        let expired = self.remove_all(self.expired(retention.now)).await;
        let report = TrimReport {
            direct_messages,
            replies_and_reactions,
            superseded_versions,
            expired,
            placeholders: self.store.prune_placeholders(),
            tombstones: self
                .store
                .prune_tombstones(retention.now.saturating_sub(self.tombstone_retention_secs)),
        };

        if report.tombstones > 0 {
            debug!("Trim forgot {} deletion tombstones", report.tombstones);
        }
        if report.total() > 0 {
            info!(
                "Trim removed {} events ({} DMs, {} replies/reactions, {} old versions, {} expired, {} placeholders)",
                report.total(),
                report.direct_messages,
                report.replies_and_reactions,
                report.superseded_versions,
                report.expired,
                report.placeholders,
            );
        }
        TrimOutcome::Completed(report)
    }

    /// Run [`TrimService::trim`] every `interval` until `shutdown` fires.
    pub fn spawn_periodic<F>(
        self: Arc<Self>,
        interval: Duration,
        retention: F,
        shutdown: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Fn() -> RetentionContext + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let context = retention();
                        self.trim(&context).await;
                    }
                }
            }
            debug!("Periodic trim stopped");
        })
    }

    async fn remove_all(&self, ids: Vec<String>) -> usize {
        let mut removed = 0;
        for id in ids {
            if self.store.remove(&id) {
                removed += 1;
            }
            tokio::task::yield_now().await;
        }
        removed
    }

    fn is_observed(&self, id: &str) -> bool {
        self.store.get_note(id).is_some_and(|n| n.is_observed())
    }

    fn old_direct_messages(&self, retention: &RetentionContext) -> Vec<String> {
        let cutoff = retention.now.saturating_sub(self.dm_retention_secs);
        let messages = self
            .store
            .scan(false, |event, _| event.known_kind().is_direct_message());

        let mut conversations: HashMap<BTreeSet<String>, Vec<Arc<Event>>> = HashMap::new();
        for message in messages {
            conversations
                .entry(conversation_key(&message))
                .or_default()
                .push(message);
        }

        let mut doomed = Vec::new();
        for mut messages in conversations.into_values() {
            messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
            doomed.extend(
                messages
                    .iter()
                    .skip(1)
                    .filter(|m| m.created_at < cutoff)
                    .filter(|m| !self.is_observed(&m.id))
                    .map(|m| m.id.clone()),
            );
        }
        doomed
    }

    fn unretained_replies(&self, retention: &RetentionContext) -> Vec<String> {
        let accounts = &retention.accounts;
        let candidates = self.store.scan(false, |event, note| {
            let trimmable = match event.known_kind() {
                KnownKind::TextNote => event.is_reply(),
                KnownKind::Reaction
                | KnownKind::Repost
                | KnownKind::GenericRepost
                | KnownKind::Zap
                | KnownKind::ZapRequest
                | KnownKind::Report => true,
                _ => false,
            };
            trimmable
                && !note.is_observed()
                && !accounts.contains(&event.pubkey)
                && !event.tags_any_pubkey(accounts)
        });

        candidates
            .into_iter()
            .filter(|event| !event.referenced_event_ids().any(|parent| self.is_observed(parent)))
            .map(|event| event.id.clone())
            .collect()
    }

    fn expired(&self, now: u64) -> Vec<String> {
        self.store
            .scan(true, |event, _| event.is_expired(now))
            .into_iter()
            .map(|event| event.id.clone())
            .collect()
    }
}

/// Participants of a private conversation. Gift wraps hide the sender, so
/// they group by recipient only.
fn conversation_key(event: &Event) -> BTreeSet<String> {
    let mut members: BTreeSet<String> = event.referenced_pubkeys().map(String::from).collect();
    if event.known_kind() != KnownKind::GiftWrap {
        members.insert(event.pubkey.clone());
    }
    members
}
