//! Store-owned wrapper around an event.

use crate::event::{Event, EventAddress};
use crate::relay::RelayUrl;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;

/// Identity of a note: an event id, or the replaceable/addressable key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NoteKey {
    Id(String),
    Address(EventAddress),
}

impl From<EventAddress> for NoteKey {
    fn from(address: EventAddress) -> Self {
        Self::Address(address)
    }
}

/// What observers of a note see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteState {
    /// `None` while the note is a placeholder (or after removal)
    pub event: Option<Arc<Event>>,
    /// Relays this event (or the current version) was seen on
    pub relays: BTreeSet<RelayUrl>,
    /// Set once the store has evicted or deleted the note
    pub removed: bool,
}

/// A note is created on first insert or as a placeholder, and is only
/// dropped by the store. Mutation happens exclusively through the store's
/// write lock; readers subscribe to [`Note::watch`].
#[derive(Debug)]
pub struct Note {
    key: NoteKey,
    state: watch::Sender<NoteState>,
}

impl Note {
    pub(crate) fn placeholder(key: NoteKey) -> Self {
        let (state, _) = watch::channel(NoteState::default());
        Self { key, state }
    }

    pub fn key(&self) -> &NoteKey {
        &self.key
    }

    pub fn event(&self) -> Option<Arc<Event>> {
        self.state.borrow().event.clone()
    }

    pub fn is_placeholder(&self) -> bool {
        self.state.borrow().event.is_none()
    }

    pub fn relays(&self) -> BTreeSet<RelayUrl> {
        self.state.borrow().relays.clone()
    }

    /// Observe changes to this note.
    pub fn watch(&self) -> watch::Receiver<NoteState> {
        self.state.subscribe()
    }

    /// True while any consumer holds a receiver from [`Note::watch`].
    pub fn is_observed(&self) -> bool {
        self.state.receiver_count() > 0
    }

    pub(crate) fn populate(&self, event: Arc<Event>, relay: Option<&RelayUrl>) {
        self.state.send_modify(|state| {
            let replaced = state.event.as_ref().is_some_and(|e| e.id != event.id);
            if replaced {
                state.relays.clear();
            }
            state.event = Some(event);
            state.removed = false;
            if let Some(relay) = relay {
                state.relays.insert(relay.clone());
            }
        });
    }

    /// Returns true when the relay was new for this note.
    pub(crate) fn add_relay(&self, relay: &RelayUrl) -> bool {
        self.state.send_if_modified(|state| state.relays.insert(relay.clone()))
    }

    pub(crate) fn mark_removed(&self) {
        self.state.send_modify(|state| {
            state.event = None;
            state.removed = true;
        });
    }
}
