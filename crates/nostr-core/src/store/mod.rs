//! The local store: the single consistent view of everything verified so far.
//!
//! One `RwLock` covers the primary maps and the secondary indices, so a
//! reader never observes an event in one and not the other. Note state is
//! pushed to observers through `watch` channels; store-wide changes are
//! broadcast as [`StoreEvent`]s.

mod index;
mod note;

pub use note::{Note, NoteKey, NoteState};

use crate::decrypt::DecryptionCache;
use crate::event::{Event, EventAddress, KindClass, KIND_DELETION};
use crate::filter::Filter;
use crate::relay::RelayUrl;
use crate::verify::{verify, VerifyMetrics};
use index::Indices;
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Buffered store notifications per subscriber.
const STORE_EVENT_CAPACITY: usize = 1024;

/// Deleted ids and deleted addresses remembered, each.
const DEFAULT_TOMBSTONE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New event, or new current version of a replaceable/addressable key
    Added,
    /// Lost against the current version; kept only as history
    Superseded,
    /// Already known; observed-relay set updated
    Duplicate,
    /// Failed verification; never stored
    Rejected,
    /// Verified and announced, never retained
    Ephemeral,
    /// Target of a deletion request by the same author
    Deleted,
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Inserted(Arc<Event>),
    Ephemeral(Arc<Event>),
    Removed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub events: usize,
    pub addressables: usize,
    pub superseded: usize,
    pub placeholders: usize,
    pub index_entries: usize,
    pub deletions: usize,
}

/// A deletion request that matched (or may later match) a target.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    /// Latest `created_at` among the deletion requests
    deleted_at: u64,
    /// A stored event was removed because of it
    matched: bool,
}

impl Tombstone {
    fn record(&mut self, deleted_at: u64, matched: bool) {
        self.deleted_at = self.deleted_at.max(deleted_at);
        self.matched |= matched;
    }

    fn is_stale(&self, horizon: u64) -> bool {
        !self.matched && self.deleted_at < horizon
    }
}

struct Inner {
    /// Every stored event by id (regular, current and retained versions) plus
    /// id placeholders
    notes: HashMap<String, Arc<Note>>,
    /// Current version per replaceable/addressable key, plus placeholders
    addressables: HashMap<EventAddress, Arc<Note>>,
    current_ids: HashMap<String, EventAddress>,
    superseded: HashMap<String, EventAddress>,
    history: HashMap<EventAddress, BTreeSet<String>>,
    indices: Indices,
    /// Deleted id -> requesting pubkey -> tombstone. Only the entry of the
    /// target's author suppresses it.
    deleted_ids: LruCache<String, HashMap<String, Tombstone>>,
    deleted_addresses: LruCache<EventAddress, Tombstone>,
}

pub struct LocalStore {
    inner: RwLock<Inner>,
    retain_superseded: bool,
    metrics: Arc<VerifyMetrics>,
    events: broadcast::Sender<StoreEvent>,
    decryption: Option<Arc<DecryptionCache>>,
}

impl LocalStore {
    pub fn new(retain_superseded: bool) -> Self {
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner::new(DEFAULT_TOMBSTONE_CAPACITY)),
            retain_superseded,
            metrics: Arc::new(VerifyMetrics::new()),
            events,
            decryption: None,
        }
    }

    /// Bound the deletion tombstones. Least recently touched ones go first.
    pub fn with_tombstone_capacity(self, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        {
            let mut inner = self.inner.write();
            inner.deleted_ids.resize(capacity);
            inner.deleted_addresses.resize(capacity);
        }
        self
    }

    /// Removals will also drop cached plaintext for the removed events.
    pub fn with_decryption_cache(mut self, cache: Arc<DecryptionCache>) -> Self {
        self.decryption = Some(cache);
        self
    }

    pub fn metrics(&self) -> Arc<VerifyMetrics> {
        self.metrics.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // ── Insert ──────────────────────────────────────────────────

    /// Verify and insert. Verification happens before the store is touched.
    pub fn insert(&self, event: Event, relay: Option<&RelayUrl>) -> InsertOutcome {
        let ok = verify(&event);
        self.metrics.record(ok);
        if !ok {
            debug!("Rejected event {} from {:?}: verification failed", event.id, relay);
            return InsertOutcome::Rejected;
        }
        let event = Arc::new(event);

        if event.class() == KindClass::Ephemeral {
            let _ = self.events.send(StoreEvent::Ephemeral(event));
            return InsertOutcome::Ephemeral;
        }

        let mut removed = Vec::new();
        let outcome = {
            let mut inner = self.inner.write();
            inner.insert(event.clone(), relay, self.retain_superseded, &mut removed)
        };

        self.after_removal(&removed);
        if outcome == InsertOutcome::Added {
            let _ = self.events.send(StoreEvent::Inserted(event));
        }
        outcome
    }

    /// Record that a relay has the event (e.g. an `OK` for a publish).
    pub fn mark_seen(&self, id: &str, relay: &RelayUrl) -> bool {
        let inner = self.inner.read();
        let Some(note) = inner.notes.get(id) else {
            return false;
        };
        if note.is_placeholder() {
            return false;
        }
        note.add_relay(relay);
        if let Some(address) = inner.current_ids.get(id) {
            if let Some(current) = inner.addressables.get(address) {
                current.add_relay(relay);
            }
        }
        true
    }

    // ── Reads ───────────────────────────────────────────────────

    /// A queryable event by id. Superseded versions are not returned.
    pub fn get(&self, id: &str) -> Option<Arc<Event>> {
        self.inner.read().queryable(id)
    }

    /// Any stored event by id, including superseded versions.
    pub fn get_version(&self, id: &str) -> Option<Arc<Event>> {
        self.inner.read().notes.get(id)?.event()
    }

    pub fn get_note(&self, id: &str) -> Option<Arc<Note>> {
        self.inner.read().notes.get(id).cloned()
    }

    /// Current version of a replaceable/addressable key.
    pub fn get_by_key(&self, address: &EventAddress) -> Option<Arc<Event>> {
        self.inner.read().addressables.get(address)?.event()
    }

    /// Same as [`LocalStore::get_by_key`] for `kind:pubkey:d` text.
    pub fn get_by_address_str(&self, address: &str) -> Option<Arc<Event>> {
        let address: EventAddress = address.parse().ok()?;
        self.get_by_key(&address)
    }

    pub fn get_address_note(&self, address: &EventAddress) -> Option<Arc<Note>> {
        self.inner.read().addressables.get(address).cloned()
    }

    /// Return the note for `key`, creating an empty placeholder if needed.
    /// A later insert of the matching event fills the same note in place.
    pub fn get_or_create_placeholder(&self, key: NoteKey) -> Arc<Note> {
        if let Some(note) = self.inner.read().note_for(&key) {
            return note;
        }
        let mut inner = self.inner.write();
        match key {
            NoteKey::Id(id) => inner
                .notes
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Note::placeholder(NoteKey::Id(id))))
                .clone(),
            NoteKey::Address(address) => inner
                .addressables
                .entry(address.clone())
                .or_insert_with(|| Arc::new(Note::placeholder(NoteKey::Address(address))))
                .clone(),
        }
    }

    /// Superseded versions retained for a key, newest first.
    pub fn history(&self, address: &EventAddress) -> Vec<Arc<Event>> {
        let inner = self.inner.read();
        let mut versions: Vec<Arc<Event>> = inner
            .history
            .get(address)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.notes.get(id)?.event())
            .collect();
        sort_newest_first(&mut versions);
        versions
    }

    /// Evaluate a filter against the local view, newest first.
    ///
    /// An unconstrained filter is rejected (logged) and yields nothing.
    pub fn query(&self, filter: &Filter) -> Vec<Arc<Event>> {
        if let Err(e) = filter.validate() {
            warn!("Refusing local query {}: {e}", filter.as_json());
            return Vec::new();
        }
        let inner = self.inner.read();
        let mut events: Vec<Arc<Event>> =
            if let Some(ids) = filter.ids.as_ref().filter(|ids| !ids.is_empty()) {
                ids.iter().filter_map(|id| inner.queryable(id)).collect()
            } else if let Some(candidates) = inner.indices.candidates(filter) {
                candidates
                    .iter()
                    .filter_map(|id| inner.queryable(id))
                    .collect()
            } else {
                inner
                    .notes
                    .keys()
                    .filter_map(|id| inner.queryable(id))
                    .collect()
            };
        drop(inner);

        events.retain(|e| filter.matches(e));
        sort_newest_first(&mut events);
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        events
    }

    pub fn len(&self) -> usize {
        self.stats().events
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let placeholders = inner.notes.values().filter(|n| n.is_placeholder()).count()
            + inner
                .addressables
                .values()
                .filter(|n| n.is_placeholder())
                .count();
        let populated = inner.notes.len()
            - inner.notes.values().filter(|n| n.is_placeholder()).count();
        StoreStats {
            events: populated - inner.superseded.len(),
            addressables: inner.current_ids.len(),
            superseded: inner.superseded.len(),
            placeholders,
            index_entries: inner.indices.entry_count(),
            deletions: inner.deleted_ids.iter().map(|(_, by)| by.len()).sum::<usize>()
                + inner.deleted_addresses.len(),
        }
    }

    // ── Eviction support ────────────────────────────────────────

    /// Queryable events (and their id notes) for which `pred` holds.
    /// Collected under one read lock; callers remove them one by one.
    pub fn scan<F>(&self, include_superseded: bool, mut pred: F) -> Vec<Arc<Event>>
    where
        F: FnMut(&Event, &Note) -> bool,
    {
        let inner = self.inner.read();
        inner
            .notes
            .iter()
            .filter(|(id, _)| include_superseded || !inner.superseded.contains_key(*id))
            .filter_map(|(_, note)| {
                let event = note.event()?;
                pred(event.as_ref(), note.as_ref()).then_some(event)
            })
            .collect()
    }

    pub fn superseded_ids(&self) -> Vec<String> {
        self.inner.read().superseded.keys().cloned().collect()
    }

    /// The only way an event leaves the store (besides deletion requests).
    /// Updates primary maps, indices and version history, then notifies
    /// observers and the decryption cache.
    pub fn remove(&self, id: &str) -> bool {
        let mut removed = Vec::new();
        let found = self.inner.write().remove_id(id, &mut removed);
        self.after_removal(&removed);
        found
    }

    /// Drop placeholders nobody holds or watches.
    pub fn prune_placeholders(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.notes.len() + inner.addressables.len();
        inner.notes.retain(|_, note| !is_idle_placeholder(note));
        inner.addressables.retain(|_, note| !is_idle_placeholder(note));
        before - (inner.notes.len() + inner.addressables.len())
    }

    /// Forget deletion requests that never removed a stored event and are
    /// older than `horizon`. Returns how many were dropped.
    pub fn prune_tombstones(&self, horizon: u64) -> usize {
        let mut inner = self.inner.write();
        let mut pruned = 0;

        let mut empty_ids = Vec::new();
        for (id, by) in inner.deleted_ids.iter_mut() {
            let before = by.len();
            by.retain(|_, tombstone| !tombstone.is_stale(horizon));
            pruned += before - by.len();
            if by.is_empty() {
                empty_ids.push(id.clone());
            }
        }
        for id in empty_ids {
            inner.deleted_ids.pop(&id);
        }

        let stale_addresses: Vec<EventAddress> = inner
            .deleted_addresses
            .iter()
            .filter(|(_, tombstone)| tombstone.is_stale(horizon))
            .map(|(address, _)| address.clone())
            .collect();
        for address in stale_addresses {
            inner.deleted_addresses.pop(&address);
            pruned += 1;
        }
        pruned
    }

    fn after_removal(&self, removed: &[String]) {
        for id in removed {
            if let Some(cache) = &self.decryption {
                cache.invalidate_event(id);
            }
            let _ = self.events.send(StoreEvent::Removed(id.clone()));
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(true)
    }
}

fn is_idle_placeholder(note: &Arc<Note>) -> bool {
    note.is_placeholder() && !note.is_observed() && Arc::strong_count(note) == 1
}

/// `a` replaces `b`: newer wins, equal timestamps go to the lower id.
fn wins(a: &Event, b: &Event) -> bool {
    a.created_at > b.created_at || (a.created_at == b.created_at && a.id < b.id)
}

fn sort_newest_first(events: &mut [Arc<Event>]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

impl Inner {
    fn new(tombstone_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(tombstone_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            notes: HashMap::new(),
            addressables: HashMap::new(),
            current_ids: HashMap::new(),
            superseded: HashMap::new(),
            history: HashMap::new(),
            indices: Indices::default(),
            deleted_ids: LruCache::new(capacity),
            deleted_addresses: LruCache::new(capacity),
        }
    }

    fn queryable(&self, id: &str) -> Option<Arc<Event>> {
        if self.superseded.contains_key(id) {
            return None;
        }
        self.notes.get(id)?.event()
    }

    fn note_for(&self, key: &NoteKey) -> Option<Arc<Note>> {
        match key {
            NoteKey::Id(id) => self.notes.get(id).cloned(),
            NoteKey::Address(address) => self.addressables.get(address).cloned(),
        }
    }

    fn id_note(&mut self, id: &str) -> Arc<Note> {
        self.notes
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Note::placeholder(NoteKey::Id(id.to_string()))))
            .clone()
    }

    fn is_deleted(&self, event: &Event) -> bool {
        if self
            .deleted_ids
            .peek(&event.id)
            .is_some_and(|by| by.contains_key(&event.pubkey))
        {
            return true;
        }
        event.address().is_some_and(|address| {
            self.deleted_addresses
                .peek(&address)
                .is_some_and(|tombstone| tombstone.deleted_at >= event.created_at)
        })
    }

    fn insert(
        &mut self,
        event: Arc<Event>,
        relay: Option<&RelayUrl>,
        retain_superseded: bool,
        removed: &mut Vec<String>,
    ) -> InsertOutcome {
        if let Some(existing) = self.notes.get(&event.id) {
            if !existing.is_placeholder() {
                if let Some(relay) = relay {
                    existing.add_relay(relay);
                    if let Some(current) = self
                        .current_ids
                        .get(&event.id)
                        .and_then(|a| self.addressables.get(a))
                    {
                        current.add_relay(relay);
                    }
                }
                return InsertOutcome::Duplicate;
            }
        }
        if self.is_deleted(&event) {
            return InsertOutcome::Deleted;
        }

        let outcome = match event.address() {
            Some(address) => self.insert_versioned(event.clone(), address, relay, retain_superseded, removed),
            None => {
                self.id_note(&event.id).populate(event.clone(), relay);
                self.indices.add(&event);
                InsertOutcome::Added
            }
        };

        if outcome == InsertOutcome::Added && event.kind == KIND_DELETION {
            self.apply_deletion(&event, removed);
        }
        outcome
    }

    fn insert_versioned(
        &mut self,
        event: Arc<Event>,
        address: EventAddress,
        relay: Option<&RelayUrl>,
        retain_superseded: bool,
        removed: &mut Vec<String>,
    ) -> InsertOutcome {
        let current = self.addressables.get(&address).and_then(|n| n.event());

        if let Some(current) = &current {
            if !wins(&event, current) {
                if retain_superseded {
                    self.id_note(&event.id).populate(event.clone(), relay);
                    self.superseded.insert(event.id.clone(), address.clone());
                    self.history.entry(address).or_default().insert(event.id.clone());
                }
                debug!("Event {} superseded by {}", event.id, current.id);
                return InsertOutcome::Superseded;
            }

            self.indices.remove(current);
            self.current_ids.remove(&current.id);
            if retain_superseded {
                self.superseded.insert(current.id.clone(), address.clone());
                self.history
                    .entry(address.clone())
                    .or_default()
                    .insert(current.id.clone());
            } else if let Some(old) = self.notes.remove(&current.id) {
                old.mark_removed();
                removed.push(current.id.clone());
            }
        }

        self.id_note(&event.id).populate(event.clone(), relay);
        self.addressables
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Note::placeholder(NoteKey::Address(address.clone()))))
            .populate(event.clone(), relay);
        self.current_ids.insert(event.id.clone(), address);
        self.indices.add(&event);
        InsertOutcome::Added
    }

    /// NIP-09: only the author of a target may delete it. Requests from
    /// anyone else are recorded under their own pubkey and never touch the
    /// author's tombstone.
    fn apply_deletion(&mut self, deletion: &Event, removed: &mut Vec<String>) {
        let ids: Vec<String> = deletion.referenced_event_ids().map(String::from).collect();
        for id in ids {
            let author = self.notes.get(&id).and_then(|n| n.event()).map(|e| e.pubkey.clone());
            let matched = match author {
                Some(author) if author != deletion.pubkey => continue,
                Some(_) => self.remove_id(&id, removed),
                None => false,
            };
            self.deleted_ids
                .get_or_insert_mut(id, HashMap::new)
                .entry(deletion.pubkey.clone())
                .or_insert(Tombstone {
                    deleted_at: 0,
                    matched: false,
                })
                .record(deletion.created_at, matched);
        }

        let addresses: Vec<EventAddress> = deletion
            .referenced_addresses()
            .filter(|a| a.pubkey == deletion.pubkey)
            .collect();
        for address in addresses {
            let target = self
                .addressables
                .get(&address)
                .and_then(|n| n.event())
                .filter(|e| e.created_at <= deletion.created_at);
            let matched = target.is_some_and(|target| self.remove_id(&target.id, removed));
            self.deleted_addresses
                .get_or_insert_mut(address, || Tombstone {
                    deleted_at: 0,
                    matched: false,
                })
                .record(deletion.created_at, matched);
        }
    }

    fn remove_id(&mut self, id: &str, removed: &mut Vec<String>) -> bool {
        let Some(note) = self.notes.get(id).cloned() else {
            return false;
        };
        let Some(event) = note.event() else {
            return false;
        };

        if let Some(address) = self.current_ids.remove(id) {
            self.indices.remove(&event);
            if let Some(current) = self.addressables.remove(&address) {
                current.mark_removed();
            }
        } else if let Some(address) = self.superseded.remove(id) {
            if let Some(versions) = self.history.get_mut(&address) {
                versions.remove(id);
                if versions.is_empty() {
                    self.history.remove(&address);
                }
            }
        } else {
            self.indices.remove(&event);
        }

        self.notes.remove(id);
        note.mark_removed();
        removed.push(id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTemplate;
    use crate::verify::{keypair_from_secret, sign};
    use secp256k1::Keypair;

    fn alice() -> Keypair {
        keypair_from_secret(&[0x11; 32]).unwrap()
    }

    fn bob() -> Keypair {
        keypair_from_secret(&[0x22; 32]).unwrap()
    }

    fn note(keys: &Keypair, created_at: u64, content: &str) -> Event {
        sign(EventTemplate::new(1, created_at, content), keys)
    }

    fn article(keys: &Keypair, created_at: u64, d: &str, content: &str) -> Event {
        sign(
            EventTemplate::new(30023, created_at, content).tag(["d", d]),
            keys,
        )
    }

    fn relay(name: &str) -> RelayUrl {
        RelayUrl::parse(name).unwrap()
    }

    #[test]
    fn forged_events_never_enter() {
        let store = LocalStore::default();
        let mut forged = note(&alice(), 10, "hi");
        forged.content = "tampered".into();
        assert_eq!(store.insert(forged.clone(), None), InsertOutcome::Rejected);
        assert!(store.get(&forged.id).is_none());
        assert_eq!(store.metrics().snapshot(), (0, 1));
    }

    #[test]
    fn insert_is_idempotent_and_tracks_relays() {
        let store = LocalStore::default();
        let e = note(&alice(), 10, "hi");
        let (r1, r2) = (relay("one.example.com"), relay("two.example.com"));
        assert_eq!(store.insert(e.clone(), Some(&r1)), InsertOutcome::Added);
        assert_eq!(store.insert(e.clone(), Some(&r2)), InsertOutcome::Duplicate);
        assert_eq!(store.insert(e.clone(), Some(&r2)), InsertOutcome::Duplicate);
        assert_eq!(store.len(), 1);
        let relays = store.get_note(&e.id).unwrap().relays();
        assert_eq!(relays, BTreeSet::from([r1, r2]));
    }

    #[test]
    fn newer_addressable_wins_regardless_of_order() {
        // created_at 100 then 90: the 90 version is superseded.
        let store = LocalStore::default();
        let newer = article(&alice(), 100, "post", "v2");
        let older = article(&alice(), 90, "post", "v1");
        assert_eq!(store.insert(newer.clone(), None), InsertOutcome::Added);
        assert_eq!(store.insert(older.clone(), None), InsertOutcome::Superseded);

        let address = newer.address().unwrap();
        assert_eq!(store.get_by_key(&address).unwrap().id, newer.id);
        assert!(store.get(&older.id).is_none());
        assert_eq!(store.get_version(&older.id).unwrap().id, older.id);

        let found = store.query(&Filter::new().kind(30023).author(&newer.pubkey));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, newer.id);

        // Reverse order reaches the same state.
        let store = LocalStore::default();
        assert_eq!(store.insert(older.clone(), None), InsertOutcome::Added);
        assert_eq!(store.insert(newer.clone(), None), InsertOutcome::Added);
        assert_eq!(store.get_by_key(&address).unwrap().id, newer.id);
        assert_eq!(store.history(&address).len(), 1);
        assert!(store.query(&Filter::new().id(&older.id)).is_empty());
    }

    #[test]
    fn equal_timestamps_keep_lowest_id() {
        let a = article(&alice(), 50, "x", "first");
        let b = article(&alice(), 50, "x", "second");
        let (low, high) = if a.id < b.id { (a, b) } else { (b, a) };

        let store = LocalStore::default();
        store.insert(high.clone(), None);
        assert_eq!(store.insert(low.clone(), None), InsertOutcome::Added);
        assert_eq!(store.get_by_key(&low.address().unwrap()).unwrap().id, low.id);

        let store = LocalStore::default();
        store.insert(low.clone(), None);
        assert_eq!(store.insert(high, None), InsertOutcome::Superseded);
        assert_eq!(store.get_by_key(&low.address().unwrap()).unwrap().id, low.id);
    }

    #[test]
    fn replaceable_without_history_drops_old_version() {
        let store = LocalStore::new(false);
        let v1 = sign(EventTemplate::new(0, 1, "{}"), &alice());
        let v2 = sign(EventTemplate::new(0, 2, "{\"name\":\"a\"}"), &alice());
        store.insert(v1.clone(), None);
        store.insert(v2.clone(), None);
        assert!(store.get_version(&v1.id).is_none());
        assert_eq!(store.stats().superseded, 0);
        assert_eq!(store.insert(v1, None), InsertOutcome::Superseded);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn ephemeral_events_are_announced_not_kept() {
        let store = LocalStore::default();
        let mut rx = store.subscribe();
        let e = sign(EventTemplate::new(20001, 1, "typing"), &alice());
        assert_eq!(store.insert(e.clone(), None), InsertOutcome::Ephemeral);
        assert!(store.get(&e.id).is_none());
        assert!(matches!(rx.try_recv(), Ok(StoreEvent::Ephemeral(_))));
    }

    #[tokio::test]
    async fn placeholder_is_filled_in_place() {
        let store = LocalStore::default();
        let e = note(&alice(), 10, "hi");
        let placeholder = store.get_or_create_placeholder(NoteKey::Id(e.id.clone()));
        let mut rx = placeholder.watch();
        assert!(store.query(&Filter::new().kind(1)).is_empty());

        store.insert(e.clone(), None);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().event.as_ref().unwrap().id, e.id);
        assert!(Arc::ptr_eq(&placeholder, &store.get_note(&e.id).unwrap()));
    }

    #[test]
    fn query_uses_indices_and_limit() {
        let store = LocalStore::default();
        let bob_pk = crate::verify::public_key_hex(&bob());
        for t in 1..=5 {
            store.insert(note(&alice(), t, &format!("note {t}")), None);
        }
        let reply = sign(
            EventTemplate::new(1, 6, "reply").tag(["p", bob_pk.as_str()]),
            &alice(),
        );
        store.insert(reply.clone(), None);

        let tagged = store.query(&Filter::new().tag("p", [bob_pk.as_str()]));
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, reply.id);

        let latest = store.query(&Filter::new().kind(1).limit(2));
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].created_at, 6);
        assert_eq!(latest[1].created_at, 5);

        assert!(store.query(&Filter::new()).is_empty());
        assert_eq!(store.query(&Filter::new().search("NOTE 3")).len(), 1);
    }

    #[test]
    fn remove_updates_indices_and_notifies() {
        let store = LocalStore::default();
        let mut rx = store.subscribe();
        let e = note(&alice(), 10, "bye");
        store.insert(e.clone(), None);
        let _ = rx.try_recv();

        let watched = store.get_note(&e.id).unwrap();
        assert!(store.remove(&e.id));
        assert!(!store.remove(&e.id));
        assert!(store.query(&Filter::new().kind(1)).is_empty());
        assert_eq!(store.stats().index_entries, 0);
        assert!(watched.watch().borrow().removed);
        assert!(matches!(rx.try_recv(), Ok(StoreEvent::Removed(id)) if id == e.id));
    }

    #[test]
    fn deletion_by_author_removes_and_blocks() {
        let store = LocalStore::default();
        let target = note(&alice(), 10, "oops");
        store.insert(target.clone(), None);

        let deletion = sign(
            EventTemplate::new(5, 11, "").tag(["e", target.id.as_str()]),
            &alice(),
        );
        assert_eq!(store.insert(deletion, None), InsertOutcome::Added);
        assert!(store.get(&target.id).is_none());
        assert_eq!(store.insert(target, None), InsertOutcome::Deleted);
    }

    #[test]
    fn deletion_by_someone_else_is_ignored() {
        let store = LocalStore::default();
        let target = note(&alice(), 10, "mine");
        store.insert(target.clone(), None);
        let deletion = sign(
            EventTemplate::new(5, 11, "").tag(["e", target.id.as_str()]),
            &bob(),
        );
        store.insert(deletion, None);
        assert!(store.get(&target.id).is_some());
    }

    #[test]
    fn foreign_deletion_cannot_revive_deleted_event() {
        let store = LocalStore::default();
        let target = note(&alice(), 10, "oops");
        store.insert(target.clone(), None);
        store.insert(
            sign(EventTemplate::new(5, 11, "").tag(["e", target.id.as_str()]), &alice()),
            None,
        );
        assert_eq!(store.insert(target.clone(), None), InsertOutcome::Deleted);

        let foreign = sign(
            EventTemplate::new(5, 12, "").tag(["e", target.id.as_str()]),
            &bob(),
        );
        assert_eq!(store.insert(foreign, None), InsertOutcome::Added);
        assert_eq!(store.insert(target, None), InsertOutcome::Deleted);
    }

    #[test]
    fn foreign_deletion_before_target_does_not_block_it() {
        let store = LocalStore::default();
        let target = note(&alice(), 10, "mine");
        store.insert(
            sign(EventTemplate::new(5, 11, "").tag(["e", target.id.as_str()]), &bob()),
            None,
        );
        assert_eq!(store.insert(target, None), InsertOutcome::Added);
    }

    #[test]
    fn unmatched_tombstones_are_pruned_after_horizon() {
        let store = LocalStore::default();
        let target = note(&alice(), 10, "oops");
        store.insert(target.clone(), None);
        store.insert(
            sign(EventTemplate::new(5, 20, "").tag(["e", target.id.as_str()]), &alice()),
            None,
        );
        // Deletions for ids never seen here.
        for i in 0..3u8 {
            let unknown = format!("{i:02x}").repeat(32);
            store.insert(
                sign(EventTemplate::new(5, 30, "").tag(["e", unknown.as_str()]), &bob()),
                None,
            );
        }
        assert_eq!(store.stats().deletions, 4);

        assert_eq!(store.prune_tombstones(30), 0);
        assert_eq!(store.prune_tombstones(31), 3);
        assert_eq!(store.stats().deletions, 1);
        assert_eq!(store.prune_tombstones(u64::MAX), 0);
        assert_eq!(store.insert(target, None), InsertOutcome::Deleted);
    }

    #[test]
    fn tombstones_are_bounded() {
        let store = LocalStore::default().with_tombstone_capacity(4);
        for i in 0..10u8 {
            let unknown = format!("{i:02x}").repeat(32);
            store.insert(
                sign(EventTemplate::new(5, 1, "").tag(["e", unknown.as_str()]), &bob()),
                None,
            );
        }
        assert_eq!(store.stats().deletions, 4);
    }

    #[tokio::test]
    async fn removal_drops_cached_plaintext() {
        use crate::decrypt::{DecryptionCache, Decryptor, EncryptionScheme};
        use crate::error::DecryptError;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Reverse(String, AtomicUsize);

        #[async_trait::async_trait]
        impl Decryptor for Reverse {
            fn signer_pubkey(&self) -> String {
                self.0.clone()
            }

            async fn decrypt(
                &self,
                ciphertext: &str,
                _counterparty: &str,
                _scheme: EncryptionScheme,
            ) -> Result<String, DecryptError> {
                self.1.fetch_add(1, Ordering::SeqCst);
                Ok(ciphertext.chars().rev().collect())
            }
        }

        let bob_pk = crate::verify::public_key_hex(&bob());
        let decryptor = Arc::new(Reverse(bob_pk.clone(), AtomicUsize::new(0)));
        let cache = Arc::new(DecryptionCache::new(8).with_decryptor(decryptor.clone()));
        let store = LocalStore::default().with_decryption_cache(cache.clone());

        let dm = sign(
            EventTemplate::new(4, 10, "olleh?iv=x").tag(["p", bob_pk.as_str()]),
            &alice(),
        );
        store.insert(dm.clone(), None);
        assert!(cache.decrypted_view(&dm).await.is_some());
        assert!(cache.cached_view(&dm).is_some());

        assert!(store.remove(&dm.id));
        assert!(cache.cached_view(&dm).is_none());
        assert!(cache.decrypted_view(&dm).await.is_some());
        assert_eq!(decryptor.1.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn address_deletion_blocks_older_versions_only() {
        let store = LocalStore::default();
        let v1 = article(&alice(), 10, "post", "v1");
        store.insert(v1.clone(), None);
        let address = v1.address().unwrap();
        let deletion = sign(
            EventTemplate::new(5, 20, "").tag(["a", address.to_string().as_str()]),
            &alice(),
        );
        store.insert(deletion, None);
        assert!(store.get_by_key(&address).is_none());
        assert_eq!(
            store.insert(article(&alice(), 15, "post", "v1.5"), None),
            InsertOutcome::Deleted
        );
        assert_eq!(
            store.insert(article(&alice(), 30, "post", "v3"), None),
            InsertOutcome::Added
        );
    }

    #[test]
    fn idle_placeholders_are_pruned() {
        let store = LocalStore::default();
        let held = store.get_or_create_placeholder(NoteKey::Id("aa".repeat(32)));
        store.get_or_create_placeholder(NoteKey::Id("bb".repeat(32)));
        assert_eq!(store.stats().placeholders, 2);
        assert_eq!(store.prune_placeholders(), 1);
        assert_eq!(store.stats().placeholders, 1);
        drop(held);
        assert_eq!(store.prune_placeholders(), 1);
    }
}
