//! Subscription multiplexer.
//!
//! Many logical queries ("keys") share one relay-level subscription per
//! group. The filters sent to each relay are a pure function of the keys
//! currently registered, so registering the same thing twice never produces
//! a second REQ. Each group's table is mutated under its own async mutex.
//!
//! Every REQ goes out under a fresh id `<group id>:<generation>`, so an EOSE
//! or CLOSED for a replaced REQ is recognised and ignored. Cursors are kept
//! per relay and per derived filter: a filter that was never delivered in
//! full is requested without a `since`. Idle groups are dropped.
//!
//! ```text
//!   Idle ──first key──▶ Subscribed ──keys change──▶ Subscribed (per-relay resubscribe)
//!    ▲                        │
//!    └────last key removed────┘
//! ```

use crate::error::{SubscriptionError, TransportError};
use crate::filter::{coalesce, Filter};
use crate::relay::RelayUrl;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source of "now" in unix seconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Outbound side of the relay connections. Reconnection and delivery are the
/// transport's business; the multiplexer only says which subscriptions exist.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send_req(
        &self,
        relay: &RelayUrl,
        subscription_id: &str,
        filters: &[Filter],
    ) -> Result<(), TransportError>;

    async fn send_close(&self, relay: &RelayUrl, subscription_id: &str)
        -> Result<(), TransportError>;
}

/// A filter aimed at one relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayFilter {
    pub relay: RelayUrl,
    pub filter: Filter,
}

impl RelayFilter {
    pub fn new(relay: RelayUrl, filter: Filter) -> Self {
        Self { relay, filter }
    }

    /// The same filter on every relay.
    pub fn fan_out<'a>(
        relays: impl IntoIterator<Item = &'a RelayUrl>,
        filter: &Filter,
    ) -> Vec<Self> {
        relays
            .into_iter()
            .map(|relay| Self::new(relay.clone(), filter.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Subscribed,
}

/// Per-relay filters for a set of registrations: grouped by relay,
/// canonicalized, deduplicated and merged where semantics allow.
pub fn derive_relay_filters<'a, I>(filters: I) -> BTreeMap<RelayUrl, Vec<Filter>>
where
    I: IntoIterator<Item = &'a RelayFilter>,
{
    let mut by_relay: BTreeMap<RelayUrl, Vec<Filter>> = BTreeMap::new();
    for rf in filters {
        by_relay
            .entry(rf.relay.clone())
            .or_default()
            .push(rf.filter.clone());
    }
    by_relay
        .into_iter()
        .map(|(relay, filters)| (relay, coalesce(filters)))
        .collect()
}

fn generate_group_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// The group id part of a relay-level subscription id (`<group id>:<generation>`).
fn group_id_of(subscription_id: &str) -> &str {
    subscription_id
        .split_once(':')
        .map_or(subscription_id, |(group_id, _)| group_id)
}

struct Group {
    name: String,
    id: String,
    state: Mutex<GroupInner>,
}

/// One REQ currently open on a relay.
#[derive(Debug, Clone)]
struct OpenSubscription {
    sub_id: String,
    /// As derived, before cursors are applied
    filters: Vec<Filter>,
}

#[derive(Default)]
struct GroupInner {
    keys: BTreeMap<String, Vec<RelayFilter>>,
    observers: HashMap<String, CancellationToken>,
    active: BTreeMap<RelayUrl, OpenSubscription>,
    /// Per relay, the cursor of every filter whose backlog that relay has
    /// delivered. A filter without an entry is requested from the start.
    cursors: HashMap<RelayUrl, HashMap<Filter, u64>>,
    eose: HashSet<RelayUrl>,
    generation: u64,
    /// Removed from the multiplexer; callers holding it must look up again
    retired: bool,
}

impl GroupInner {
    fn next_subscription_id(&mut self, group_id: &str) -> String {
        self.generation += 1;
        format!("{group_id}:{}", self.generation)
    }

    fn with_cursors(&self, relay: &RelayUrl, filters: &[Filter]) -> Vec<Filter> {
        let cursors = self.cursors.get(relay);
        filters
            .iter()
            .map(|filter| match cursors.and_then(|c| c.get(filter)) {
                Some(cursor) => filter.since_for_relay(*cursor),
                None => filter.clone(),
            })
            .collect()
    }

    fn is_idle(&self) -> bool {
        self.keys.is_empty() && self.active.is_empty()
    }
}

struct Shared {
    transport: Arc<dyn RelayTransport>,
    groups: RwLock<HashMap<String, Arc<Group>>>,
    /// Group id -> group name
    routes: RwLock<HashMap<String, String>>,
    clock_skew_secs: u64,
    clock: Clock,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Shared>,
}

impl Multiplexer {
    pub fn new(transport: Arc<dyn RelayTransport>, clock_skew_secs: u64) -> Self {
        Self::with_clock(transport, clock_skew_secs, Arc::new(crate::now_secs))
    }

    pub fn with_clock(transport: Arc<dyn RelayTransport>, clock_skew_secs: u64, clock: Clock) -> Self {
        Self {
            inner: Arc::new(Shared {
                transport,
                groups: RwLock::new(HashMap::new()),
                routes: RwLock::new(HashMap::new()),
                clock_skew_secs,
                clock,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    // ── Registration ────────────────────────────────────────────

    /// Register (or replace) a logical key with fixed filters.
    pub async fn register(
        &self,
        group: &str,
        key: &str,
        filters: Vec<RelayFilter>,
    ) -> Result<(), SubscriptionError> {
        self.set_key(group, key, filters, None).await
    }

    /// Register a key whose filters follow a watch channel. The key is
    /// re-derived on every change until it is unregistered or the
    /// multiplexer shuts down.
    pub async fn register_watched(
        &self,
        group: &str,
        key: &str,
        mut filters: watch::Receiver<Vec<RelayFilter>>,
    ) -> Result<(), SubscriptionError> {
        let token = self.inner.shutdown.child_token();
        let initial = filters.borrow_and_update().clone();
        self.set_key(group, key, initial, Some(token.clone())).await?;

        let this = self.clone();
        let group = group.to_string();
        let key = key.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = filters.changed() => {
                        if changed.is_err() {
                            // Sender gone: the last filters stay registered.
                            break;
                        }
                        let next = filters.borrow_and_update().clone();
                        if let Err(e) = this.update_observed(&group, &key, next, &token).await {
                            warn!("Observer for {group}/{key} produced bad filters: {e}");
                        }
                    }
                }
            }
            debug!("Observer for {group}/{key} stopped");
        });
        Ok(())
    }

    /// Remove a key. Returns false if it was not registered.
    pub async fn unregister(&self, group: &str, key: &str) -> bool {
        let Some(group) = self.existing_group(group) else {
            return false;
        };
        let mut state = group.state.lock().await;
        if let Some(token) = state.observers.remove(key) {
            token.cancel();
        }
        let existed = state.keys.remove(key).is_some();
        if existed {
            self.reconcile(&group, &mut state).await;
        }
        existed
    }

    async fn set_key(
        &self,
        group: &str,
        key: &str,
        filters: Vec<RelayFilter>,
        observer: Option<CancellationToken>,
    ) -> Result<(), SubscriptionError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SubscriptionError::ShutDown);
        }
        validate(key, &filters)?;

        loop {
            let group = self.group(group);
            let mut state = group.state.lock().await;
            if state.retired {
                // Went idle and was removed while we waited for the lock.
                continue;
            }
            if let Some(previous) = state.observers.remove(key) {
                previous.cancel();
            }
            if let Some(token) = observer {
                state.observers.insert(key.to_string(), token);
            }
            state.keys.insert(key.to_string(), filters);
            self.reconcile(&group, &mut state).await;
            return Ok(());
        }
    }

    async fn update_observed(
        &self,
        group: &str,
        key: &str,
        filters: Vec<RelayFilter>,
        token: &CancellationToken,
    ) -> Result<(), SubscriptionError> {
        validate(key, &filters)?;
        let Some(group) = self.existing_group(group) else {
            return Ok(());
        };
        let mut state = group.state.lock().await;
        // Unregistered or replaced while we waited for the lock.
        if token.is_cancelled() || state.retired {
            return Ok(());
        }
        state.keys.insert(key.to_string(), filters);
        self.reconcile(&group, &mut state).await;
        Ok(())
    }

    // ── Relay feedback ──────────────────────────────────────────

    /// Relay finished sending stored events for a subscription. Every filter
    /// of that REQ gets a cursor of now minus the clock-skew allowance.
    /// EOSE for a REQ that has since been replaced is ignored.
    pub async fn on_eose(&self, relay: &RelayUrl, subscription_id: &str) -> bool {
        let Some(group) = self.group_for_subscription(subscription_id) else {
            debug!("EOSE from {relay} for unknown subscription {subscription_id}");
            return false;
        };
        let mut state = group.state.lock().await;
        let Some(open) = state.active.get(relay) else {
            return false;
        };
        if open.sub_id != subscription_id {
            debug!(
                "Stale EOSE from {relay} for {subscription_id}, current is {}",
                open.sub_id
            );
            return false;
        }
        let filters = open.filters.clone();
        let cursor = (self.inner.clock)().saturating_sub(self.inner.clock_skew_secs);
        let cursors = state.cursors.entry(relay.clone()).or_default();
        for filter in filters {
            let entry = cursors.entry(filter).or_insert(cursor);
            *entry = (*entry).max(cursor);
        }
        state.eose.insert(relay.clone());
        debug!("EOSE {} on {relay}, cursor {cursor}", group.name);
        true
    }

    /// The relay ended our subscription on its side. It will be reopened on
    /// the next change to the group or on reconnect.
    pub async fn on_closed(&self, relay: &RelayUrl, subscription_id: &str, reason: &str) -> bool {
        let Some(group) = self.group_for_subscription(subscription_id) else {
            return false;
        };
        let mut state = group.state.lock().await;
        if !state
            .active
            .get(relay)
            .is_some_and(|open| open.sub_id == subscription_id)
        {
            return false;
        }
        warn!("Relay {relay} closed {} ({subscription_id}): {reason}", group.name);
        state.eose.remove(relay);
        state.active.remove(relay);
        true
    }

    /// Re-send every subscription targeting `relay`, each filter with its
    /// cursor as `since`. Called by the transport after it reconnects.
    pub async fn on_relay_reconnected(&self, relay: &RelayUrl) {
        let groups: Vec<Arc<Group>> = self.inner.groups.read().values().cloned().collect();
        for group in groups {
            let mut state = group.state.lock().await;
            let derived = derive_relay_filters(state.keys.values().flatten());
            let Some(filters) = derived.get(relay).cloned() else {
                continue;
            };
            state.eose.remove(relay);
            self.open(&group, &mut state, relay, filters).await;
        }
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Group that owns a relay-level subscription id.
    pub fn route(&self, subscription_id: &str) -> Option<String> {
        self.inner
            .routes
            .read()
            .get(group_id_of(subscription_id))
            .cloned()
    }

    /// Id of the REQ currently open for `group` on `relay`.
    pub async fn subscription_id(&self, group: &str, relay: &RelayUrl) -> Option<String> {
        let group = self.existing_group(group)?;
        let state = group.state.lock().await;
        state.active.get(relay).map(|open| open.sub_id.clone())
    }

    pub async fn group_state(&self, group: &str) -> GroupState {
        let Some(group) = self.existing_group(group) else {
            return GroupState::Idle;
        };
        let state = group.state.lock().await;
        if state.is_idle() {
            GroupState::Idle
        } else {
            GroupState::Subscribed
        }
    }

    pub async fn is_eose(&self, group: &str, relay: &RelayUrl) -> bool {
        match self.existing_group(group) {
            Some(group) => group.state.lock().await.eose.contains(relay),
            None => false,
        }
    }

    /// The `since` every open filter on `relay` would resume from, or `None`
    /// while any of them still needs its backlog.
    pub async fn cursor(&self, group: &str, relay: &RelayUrl) -> Option<u64> {
        let group = self.existing_group(group)?;
        let state = group.state.lock().await;
        let cursors = state.cursors.get(relay)?;
        let open = state.active.get(relay)?;
        open.filters
            .iter()
            .map(|filter| cursors.get(filter).copied())
            .collect::<Option<Vec<u64>>>()?
            .into_iter()
            .min()
    }

    /// Filters open per relay, as derived (cursors not applied).
    pub async fn active_filters(&self, group: &str) -> BTreeMap<RelayUrl, Vec<Filter>> {
        match self.existing_group(group) {
            Some(group) => group
                .state
                .lock()
                .await
                .active
                .iter()
                .map(|(relay, open)| (relay.clone(), open.filters.clone()))
                .collect(),
            None => BTreeMap::new(),
        }
    }

    pub async fn keys(&self, group: &str) -> Vec<String> {
        match self.existing_group(group) {
            Some(group) => group.state.lock().await.keys.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Groups with registered keys or open subscriptions.
    pub fn group_count(&self) -> usize {
        self.inner.groups.read().len()
    }

    /// Stop all observers and close every open subscription.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let groups: Vec<Arc<Group>> = self.inner.groups.read().values().cloned().collect();
        for group in groups {
            let mut state = group.state.lock().await;
            state.observers.clear();
            state.keys.clear();
            self.reconcile(&group, &mut state).await;
        }
        info!("Subscription multiplexer shut down");
    }

    // ── Internals ───────────────────────────────────────────────

    fn group(&self, name: &str) -> Arc<Group> {
        if let Some(group) = self.existing_group(name) {
            return group;
        }
        let mut groups = self.inner.groups.write();
        groups
            .entry(name.to_string())
            .or_insert_with(|| {
                let id = generate_group_id();
                self.inner
                    .routes
                    .write()
                    .insert(id.clone(), name.to_string());
                Arc::new(Group {
                    name: name.to_string(),
                    id,
                    state: Mutex::new(GroupInner::default()),
                })
            })
            .clone()
    }

    fn existing_group(&self, name: &str) -> Option<Arc<Group>> {
        self.inner.groups.read().get(name).cloned()
    }

    fn group_for_subscription(&self, subscription_id: &str) -> Option<Arc<Group>> {
        let name = self.route(subscription_id)?;
        self.existing_group(&name)
    }

    /// Drop an idle group from the group table and the routing table.
    /// Called with the group's state lock held.
    fn retire(&self, group: &Group, state: &mut GroupInner) {
        state.retired = true;
        let mut groups = self.inner.groups.write();
        if groups
            .get(&group.name)
            .is_some_and(|current| std::ptr::eq(current.as_ref(), group))
        {
            groups.remove(&group.name);
        }
        self.inner.routes.write().remove(&group.id);
        debug!("Subscription group {} removed", group.name);
    }

    /// Send a REQ for `filters` on `relay` under a fresh subscription id.
    async fn open(&self, group: &Group, state: &mut GroupInner, relay: &RelayUrl, filters: Vec<Filter>) {
        let sub_id = state.next_subscription_id(&group.id);
        let outgoing = state.with_cursors(relay, &filters);
        self.send_req(relay, &sub_id, &outgoing).await;
        state
            .active
            .insert(relay.clone(), OpenSubscription { sub_id, filters });
    }

    /// Bring the relay-level subscriptions in line with the registered keys.
    /// Only relays whose derived filters changed are touched.
    async fn reconcile(&self, group: &Group, state: &mut GroupInner) {
        let derived = derive_relay_filters(state.keys.values().flatten());

        if derived.is_empty() {
            let open = std::mem::take(&mut state.active);
            for (relay, subscription) in &open {
                self.send_close(relay, &subscription.sub_id).await;
            }
            state.cursors.clear();
            state.eose.clear();
            if !open.is_empty() {
                info!("Subscription group {} is idle", group.name);
            }
            if state.keys.is_empty() {
                self.retire(group, state);
            }
            return;
        }

        let dropped: Vec<RelayUrl> = state
            .active
            .keys()
            .filter(|relay| !derived.contains_key(*relay))
            .cloned()
            .collect();
        for relay in &dropped {
            if let Some(open) = state.active.remove(relay) {
                self.send_close(relay, &open.sub_id).await;
            }
            state.eose.remove(relay);
            state.cursors.remove(relay);
        }

        for (relay, filters) in derived {
            match state.active.get(&relay) {
                Some(current) if current.filters == filters => continue,
                Some(current) => {
                    let sub_id = current.sub_id.clone();
                    self.send_close(&relay, &sub_id).await;
                    state.eose.remove(&relay);
                }
                None => {}
            }
            if let Some(cursors) = state.cursors.get_mut(&relay) {
                cursors.retain(|filter, _| filters.contains(filter));
            }
            self.open(group, state, &relay, filters).await;
        }
    }

    async fn send_req(&self, relay: &RelayUrl, sub_id: &str, filters: &[Filter]) {
        debug!("REQ {sub_id} -> {relay} ({} filters)", filters.len());
        if let Err(e) = self.inner.transport.send_req(relay, sub_id, filters).await {
            warn!("Failed to send REQ {sub_id} to {relay}: {e}");
        }
    }

    async fn send_close(&self, relay: &RelayUrl, sub_id: &str) {
        debug!("CLOSE {sub_id} -> {relay}");
        if let Err(e) = self.inner.transport.send_close(relay, sub_id).await {
            warn!("Failed to send CLOSE {sub_id} to {relay}: {e}");
        }
    }
}

fn validate(key: &str, filters: &[RelayFilter]) -> Result<(), SubscriptionError> {
    for rf in filters {
        if let Err(source) = rf.filter.validate() {
            warn!("Rejected filter for key {key}: {source}");
            return Err(SubscriptionError::InvalidFilter {
                key: key.to_string(),
                source,
            });
        }
    }
    Ok(())
}
