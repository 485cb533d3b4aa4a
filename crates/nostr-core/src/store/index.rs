//! Secondary indices over queryable events.
//!
//! Only current events are indexed: superseded versions and placeholders are
//! invisible to queries. Updated under the store's write lock together with
//! the primary maps.

use crate::event::Event;
use crate::filter::Filter;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug, Default)]
pub(crate) struct Indices {
    by_author: HashMap<String, HashSet<String>>,
    by_kind: HashMap<u16, HashSet<String>>,
    by_tag: HashMap<(String, String), HashSet<String>>,
}

impl Indices {
    pub fn add(&mut self, event: &Event) {
        self.by_author
            .entry(event.pubkey.clone())
            .or_default()
            .insert(event.id.clone());
        self.by_kind
            .entry(event.kind)
            .or_default()
            .insert(event.id.clone());
        for key in indexed_tags(event) {
            self.by_tag.entry(key).or_default().insert(event.id.clone());
        }
    }

    pub fn remove(&mut self, event: &Event) {
        detach(&mut self.by_author, &event.pubkey, &event.id);
        detach(&mut self.by_kind, &event.kind, &event.id);
        for key in indexed_tags(event) {
            detach(&mut self.by_tag, &key, &event.id);
        }
    }

    /// Candidate ids from the most selective index the filter can use.
    /// `None` means no index applies and the caller must scan.
    pub fn candidates<'s>(&'s self, filter: &Filter) -> Option<HashSet<String>> {
        let mut best: Option<Vec<&'s HashSet<String>>> = None;
        let mut consider = |sets: Vec<&'s HashSet<String>>| {
            let size: usize = sets.iter().map(|s| s.len()).sum();
            let better = best
                .as_ref()
                .map_or(true, |b| size < b.iter().map(|s| s.len()).sum::<usize>());
            if better {
                best = Some(sets);
            }
        };

        if let Some(authors) = filter.authors.as_ref().filter(|a| !a.is_empty()) {
            consider(authors.iter().filter_map(|a| self.by_author.get(a)).collect());
        }
        if let Some(kinds) = filter.kinds.as_ref().filter(|k| !k.is_empty()) {
            consider(kinds.iter().filter_map(|k| self.by_kind.get(k)).collect());
        }
        for (name, values) in &filter.tags {
            if name.chars().count() != 1 || values.is_empty() {
                continue;
            }
            consider(
                values
                    .iter()
                    .filter_map(|v| self.by_tag.get(&(name.clone(), v.clone())))
                    .collect(),
            );
        }

        best.map(|sets| sets.into_iter().flatten().cloned().collect())
    }

    pub fn entry_count(&self) -> usize {
        self.by_author.values().map(HashSet::len).sum::<usize>()
            + self.by_kind.values().map(HashSet::len).sum::<usize>()
            + self.by_tag.values().map(HashSet::len).sum::<usize>()
    }
}

/// Single-letter tags are the queryable ones.
fn indexed_tags(event: &Event) -> HashSet<(String, String)> {
    event
        .tags
        .iter()
        .filter_map(|t| match (t.first(), t.get(1)) {
            (Some(name), Some(value)) if name.chars().count() == 1 => {
                Some((name.clone(), value.clone()))
            }
            _ => None,
        })
        .collect()
}

fn detach<K: Eq + Hash + Clone>(map: &mut HashMap<K, HashSet<String>>, key: &K, id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, author: &str, kind: u16, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: id.into(),
            pubkey: author.into(),
            created_at: 1,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn picks_smallest_index() {
        let mut idx = Indices::default();
        idx.add(&event("1", "alice", 1, vec![vec!["p", "bob"]]));
        idx.add(&event("2", "alice", 1, vec![]));
        idx.add(&event("3", "carol", 1, vec![]));

        let by_tag = idx
            .candidates(&Filter::new().kind(1).tag("p", ["bob"]))
            .unwrap();
        assert_eq!(by_tag, HashSet::from(["1".to_string()]));

        let by_author = idx.candidates(&Filter::new().kind(1).author("carol")).unwrap();
        assert_eq!(by_author, HashSet::from(["3".to_string()]));

        assert!(idx.candidates(&Filter::new().since(1)).is_none());
    }

    #[test]
    fn removal_leaves_no_empty_buckets() {
        let mut idx = Indices::default();
        let e = event("1", "alice", 7, vec![vec!["e", "x"], vec!["alt", "y"]]);
        idx.add(&e);
        assert_eq!(idx.entry_count(), 3);
        idx.remove(&e);
        assert_eq!(idx.entry_count(), 0);
        assert!(idx.by_author.is_empty());
        assert!(idx.by_tag.is_empty());
    }
}
