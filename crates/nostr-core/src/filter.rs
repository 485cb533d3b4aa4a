//! Filters: the NIP-01 query predicate.
//!
//! Sets are kept in `BTreeSet`s so a filter is canonical by construction:
//! two filters that select the same constraints compare, hash and serialize
//! identically. The multiplexer relies on that to coalesce filters across
//! logical subscriptions.

use crate::error::FilterError;
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub struct Filter {
    pub ids: Option<BTreeSet<String>>,
    pub authors: Option<BTreeSet<String>>,
    pub kinds: Option<BTreeSet<u16>>,
    /// Tag constraints keyed by tag name (without the `#`)
    pub tags: BTreeMap<String, BTreeSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = non_empty(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn id(self, id: impl Into<String>) -> Self {
        self.ids([id.into()])
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = non_empty(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn author(self, author: impl Into<String>) -> Self {
        self.authors([author.into()])
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = non_empty(kinds.into_iter().collect());
        self
    }

    pub fn kind(self, kind: u16) -> Self {
        self.kinds([kind])
    }

    /// Constrain on a single-letter (or longer) tag name, e.g. `"p"`.
    pub fn tag<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        let name = name.into();
        if values.is_empty() {
            self.tags.remove(&name);
        } else {
            self.tags.insert(name, values);
        }
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.search = (!query.trim().is_empty()).then_some(query);
        self
    }

    /// True when nothing but (at most) `limit` is set.
    pub fn is_unconstrained(&self) -> bool {
        is_unset(&self.ids)
            && is_unset(&self.authors)
            && is_unset(&self.kinds)
            && self.tags.values().all(BTreeSet::is_empty)
            && self.since.is_none()
            && self.until.is_none()
            && self.search.as_deref().map_or(true, |s| s.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        if self.is_unconstrained() {
            return Err(FilterError::Unconstrained);
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(FilterError::EmptyWindow { since, until });
            }
        }
        Ok(())
    }

    /// Validate, logging the rejection.
    pub fn validated(self) -> Result<Self, FilterError> {
        match self.validate() {
            Ok(()) => Ok(self),
            Err(e) => {
                warn!("Rejected filter {}: {e}", self.as_json());
                Err(e)
            }
        }
    }

    /// Conjunction of every present constraint. `limit` is ignored here; it
    /// applies to result sets, not to individual events.
    pub fn matches(&self, event: &Event) -> bool {
        if !set_allows(&self.ids, &event.id)
            || !set_allows(&self.authors, &event.pubkey)
            || !set_allows(&self.kinds, &event.kind)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        for (name, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            if !event.tag_values(name).any(|v| values.contains(v)) {
                return false;
            }
        }
        if let Some(query) = self.search.as_deref() {
            let query = query.trim();
            if !query.is_empty()
                && !event.content.to_lowercase().contains(&query.to_lowercase())
            {
                return false;
            }
        }
        true
    }

    /// Copy with `since` raised to at least `floor`.
    pub fn since_for_relay(&self, floor: u64) -> Self {
        let mut out = self.clone();
        out.since = Some(self.since.map_or(floor, |s| s.max(floor)));
        out
    }

    /// Merge two filters into one that selects exactly the union of their
    /// results, when that is possible without changing semantics.
    ///
    /// Only filters that differ in a single set-valued field can be merged,
    /// and never when either carries a `limit` (a union of two limited result
    /// sets is not one limited result set).
    pub fn merge(&self, other: &Filter) -> Option<Filter> {
        if self == other {
            return Some(self.clone());
        }
        if self.limit.is_some() || other.limit.is_some() {
            return None;
        }
        if self.since != other.since || self.until != other.until || self.search != other.search
        {
            return None;
        }

        let mut merged = self.clone();
        let mut differences = 0;

        if self.ids != other.ids {
            merged.ids = Some(union(self.ids.as_ref()?, other.ids.as_ref()?));
            differences += 1;
        }
        if self.authors != other.authors {
            merged.authors = Some(union(self.authors.as_ref()?, other.authors.as_ref()?));
            differences += 1;
        }
        if self.kinds != other.kinds {
            merged.kinds = Some(union(self.kinds.as_ref()?, other.kinds.as_ref()?));
            differences += 1;
        }
        if self.tags != other.tags {
            if self.tags.len() != other.tags.len() {
                return None;
            }
            for (name, values) in &self.tags {
                let theirs = other.tags.get(name)?;
                if theirs != values {
                    merged.tags.insert(name.clone(), union(values, theirs));
                    differences += 1;
                }
            }
        }

        (differences == 1).then_some(merged)
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Canonicalize a filter list: drop exact duplicates, merge what can be
/// merged, return sorted. Deterministic for a given set of inputs.
pub fn coalesce<I>(filters: I) -> Vec<Filter>
where
    I: IntoIterator<Item = Filter>,
{
    let mut current: Vec<Filter> = filters
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    loop {
        let mut next: Vec<Filter> = Vec::with_capacity(current.len());
        for filter in current.iter() {
            match next.iter().position(|f| f.merge(filter).is_some()) {
                Some(i) => {
                    if let Some(merged) = next[i].merge(filter) {
                        next[i] = merged;
                    }
                }
                None => next.push(filter.clone()),
            }
        }
        let next: Vec<Filter> = next.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        if next == current {
            return current;
        }
        current = next;
    }
}

fn non_empty<T: Ord>(set: BTreeSet<T>) -> Option<BTreeSet<T>> {
    (!set.is_empty()).then_some(set)
}

fn is_unset<T>(set: &Option<BTreeSet<T>>) -> bool {
    set.as_ref().map_or(true, BTreeSet::is_empty)
}

fn set_allows<T: Ord>(set: &Option<BTreeSet<T>>, value: &T) -> bool {
    match set {
        Some(values) if !values.is_empty() => values.contains(value),
        _ => true,
    }
}

fn union<T: Ord + Clone>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> BTreeSet<T> {
    a.union(b).cloned().collect()
}

// ── Wire form ───────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct RawFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ids: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authors: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kinds: Option<BTreeSet<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    search: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl TryFrom<RawFilter> for Filter {
    type Error = FilterError;

    fn try_from(raw: RawFilter) -> Result<Self, Self::Error> {
        let mut tags = BTreeMap::new();
        for (key, value) in raw.extra {
            let Some(name) = key.strip_prefix('#') else {
                // Unknown top-level fields are ignored, as relays do.
                continue;
            };
            if name.is_empty() {
                return Err(FilterError::BadTagKey(key));
            }
            let Value::Array(items) = value else {
                return Err(FilterError::BadTagKey(key));
            };
            let mut values = BTreeSet::new();
            for item in items {
                match item {
                    Value::String(s) => {
                        values.insert(s);
                    }
                    _ => return Err(FilterError::BadTagKey(key)),
                }
            }
            if !values.is_empty() {
                tags.insert(name.to_string(), values);
            }
        }

        let filter = Filter {
            ids: raw.ids.and_then(non_empty),
            authors: raw.authors.and_then(non_empty),
            kinds: raw.kinds.and_then(non_empty),
            tags,
            since: raw.since,
            until: raw.until,
            limit: raw.limit,
            search: raw.search.filter(|s| !s.trim().is_empty()),
        };
        filter.validate()?;
        Ok(filter)
    }
}

impl From<Filter> for RawFilter {
    fn from(filter: Filter) -> Self {
        let extra = filter
            .tags
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| {
                let values = values.into_iter().map(Value::String).collect();
                (format!("#{name}"), Value::Array(values))
            })
            .collect();
        RawFilter {
            ids: filter.ids.and_then(non_empty),
            authors: filter.authors.and_then(non_empty),
            kinds: filter.kinds.and_then(non_empty),
            since: filter.since,
            until: filter.until,
            limit: filter.limit,
            search: filter.search,
            extra,
        }
    }
}
