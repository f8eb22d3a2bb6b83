//! Three-level `(network, channel, event)` prefix trie with wildcard
//! fallthrough.
//!
//! Generalizes the `TypeId -> Vec<(Id, Box<dyn Any>)>` registry in
//! `trovochat`'s `client::dispatcher::Dispatcher` (a single-level map keyed on
//! a type) to the three lowercase-string levels the command/event dispatchers
//! need, with the wildcard represented as the empty string.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ids::{IdAllocator, REFUSED};

/// Registering (or querying) this event name is equivalent to using the
/// empty string: "any event". Mirrors the source's "raw" sentinel.
pub const RAW_EVENT_SENTINEL: &str = "raw";

fn normalize_event(event: &str) -> String {
    let lower = event.to_ascii_lowercase();
    if lower == RAW_EVENT_SENTINEL {
        String::new()
    } else {
        lower
    }
}

type EventLevel<V> = HashMap<String, HashMap<u64, Arc<V>>>;
type ChannelLevel<V> = HashMap<String, EventLevel<V>>;
type NetworkLevel<V> = HashMap<String, ChannelLevel<V>>;

struct Inner<V> {
    root: NetworkLevel<V>,
    /// Reverse index from id to its registration triple, so `unregister`
    /// doesn't need to search the whole tree.
    locations: HashMap<u64, (String, String, String)>,
}

impl<V> Default for Inner<V> {
    fn default() -> Self {
        Self {
            root: HashMap::new(),
            locations: HashMap::new(),
        }
    }
}

/// A handler registry keyed by `(network, channel, event)`.
///
/// In *unique* mode, `register` refuses (returns [`REFUSED`]) a registration
/// whose exact triple already has a handler — used by the command dispatcher,
/// which must not let two extensions silently shadow each other's literal
/// `(network, channel, name)` slot. In non-unique mode (the event dispatcher)
/// any number of handlers may share a triple.
pub struct Trie<V> {
    unique: bool,
    ids: IdAllocator,
    inner: RwLock<Inner<V>>,
}

impl<V> Trie<V> {
    pub fn new(unique: bool, ids: IdAllocator) -> Self {
        Self {
            unique,
            ids,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Insert `value` at `(network, channel, event)`, allocating a fresh id.
    ///
    /// Returns [`REFUSED`] if this trie is in unique mode and the triple
    /// already has a handler.
    pub fn register(&self, network: &str, channel: &str, event: &str, value: V) -> u64 {
        let network = network.to_ascii_lowercase();
        let channel = channel.to_ascii_lowercase();
        let event = normalize_event(event);

        let mut inner = self.inner.write();

        if self.unique
            && inner
                .root
                .get(&network)
                .and_then(|c| c.get(&channel))
                .and_then(|e| e.get(&event))
                .map(|leaf| !leaf.is_empty())
                .unwrap_or(false)
        {
            return REFUSED;
        }

        let id = self.ids.next();
        inner
            .root
            .entry(network.clone())
            .or_default()
            .entry(channel.clone())
            .or_default()
            .entry(event.clone())
            .or_default()
            .insert(id, Arc::new(value));
        inner.locations.insert(id, (network, channel, event));
        id
    }

    /// True if the exact triple currently has at least one handler.
    pub fn has_exact(&self, network: &str, channel: &str, event: &str) -> bool {
        let network = network.to_ascii_lowercase();
        let channel = channel.to_ascii_lowercase();
        let event = normalize_event(event);
        let inner = self.inner.read();
        inner
            .root
            .get(&network)
            .and_then(|c| c.get(&channel))
            .and_then(|e| e.get(&event))
            .map(|leaf| !leaf.is_empty())
            .unwrap_or(false)
    }

    /// Handlers registered at the exact triple, with no wildcard
    /// fallthrough. Used by callers that need to detect a literal
    /// duplicate registration rather than a dispatch-time match.
    pub fn exact(&self, network: &str, channel: &str, event: &str) -> Vec<Arc<V>> {
        let network = network.to_ascii_lowercase();
        let channel = channel.to_ascii_lowercase();
        let event = normalize_event(event);
        let inner = self.inner.read();
        inner
            .root
            .get(&network)
            .and_then(|c| c.get(&channel))
            .and_then(|e| e.get(&event))
            .map(|leaf| leaf.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Collect every handler whose registration triple is component-wise
    /// equal to the query, or wildcard (empty) in that component.
    ///
    /// Up to 8 leaves are visited (fewer if a query coordinate is itself
    /// empty, which collapses the literal/wildcard branch into one). No
    /// cross-leaf deduplication is performed by id: a handler registered
    /// under two triples that both match the query is returned twice. This
    /// mirrors the source's fallthrough behavior (see DESIGN.md, Open
    /// Question) and is intentional, not a bug.
    pub fn handlers(&self, network: &str, channel: &str, event: &str) -> Vec<Arc<V>> {
        let network = network.to_ascii_lowercase();
        let channel = channel.to_ascii_lowercase();
        let event = normalize_event(event);

        let inner = self.inner.read();
        let mut out = Vec::new();
        let (n_keys, n_count) = level_keys(&network);
        for n in &n_keys[..n_count] {
            let Some(clevel) = inner.root.get(*n) else {
                continue;
            };
            let (c_keys, c_count) = level_keys(&channel);
            for c in &c_keys[..c_count] {
                let Some(elevel) = clevel.get(*c) else {
                    continue;
                };
                let (e_keys, e_count) = level_keys(&event);
                for e in &e_keys[..e_count] {
                    if let Some(leaf) = elevel.get(*e) {
                        out.extend(leaf.values().cloned());
                    }
                }
            }
        }
        out
    }

    /// Remove the handler with this id, pruning now-empty intermediate
    /// nodes. Returns whether a removal occurred; returns `false` on a
    /// second call for the same id (idempotent).
    pub fn unregister(&self, id: u64) -> bool {
        let mut inner = self.inner.write();
        let Some((network, channel, event)) = inner.locations.remove(&id) else {
            return false;
        };

        let mut removed = false;
        if let Some(clevel) = inner.root.get_mut(&network) {
            if let Some(elevel) = clevel.get_mut(&channel) {
                if let Some(leaf) = elevel.get_mut(&event) {
                    removed = leaf.remove(&id).is_some();
                    if leaf.is_empty() {
                        elevel.remove(&event);
                    }
                }
                if elevel.is_empty() {
                    clevel.remove(&channel);
                }
            }
            if clevel.is_empty() {
                inner.root.remove(&network);
            }
        }
        removed
    }

    /// Total number of live handlers, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.inner.read().locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The set of level-keys to probe: the literal value, plus the wildcard
/// (empty string) if the literal isn't already empty. Returns the probe
/// array and how many of its entries are valid, so a literal that's
/// already empty collapses to a single probe instead of visiting the same
/// wildcard leaf twice.
fn level_keys(literal: &str) -> ([&str; 2], usize) {
    if literal.is_empty() {
        (["", ""], 1)
    } else {
        ([literal, ""], 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(unique: bool) -> Trie<&'static str> {
        Trie::new(unique, IdAllocator::new())
    }

    #[test]
    fn register_returns_distinct_increasing_ids() {
        let t = trie(false);
        let a = t.register("net", "#chan", "privmsg", "a");
        let b = t.register("net", "#chan", "privmsg", "b");
        assert!(b > a);
        assert_ne!(a, REFUSED);
    }

    #[test]
    fn unique_mode_refuses_duplicate_triple() {
        let t = trie(true);
        let a = t.register("net", "#chan", "cmd", "a");
        assert_ne!(a, REFUSED);
        let b = t.register("net", "#chan", "cmd", "b");
        assert_eq!(b, REFUSED);
        // a different triple still works
        let c = t.register("net", "#other", "cmd", "c");
        assert_ne!(c, REFUSED);
    }

    #[test]
    fn non_unique_mode_allows_duplicate_triple() {
        let t = trie(false);
        let a = t.register("net", "#chan", "cmd", "a");
        let b = t.register("net", "#chan", "cmd", "b");
        assert_ne!(a, REFUSED);
        assert_ne!(b, REFUSED);
        assert_eq!(t.handlers("net", "#chan", "cmd").len(), 2);
    }

    #[test]
    fn wildcard_fallthrough_matches_any_coordinate() {
        let t = trie(false);
        t.register("", "", "", "global");
        t.register("net", "", "", "network-wide");
        t.register("net", "#chan", "", "channel-wide");
        t.register("net", "#chan", "join", "exact");

        let got = t.handlers("net", "#chan", "join");
        let values: Vec<_> = got.iter().map(|v| **v).collect();
        assert!(values.contains(&"global"));
        assert!(values.contains(&"network-wide"));
        assert!(values.contains(&"channel-wide"));
        assert!(values.contains(&"exact"));
        assert_eq!(values.len(), 4);

        // a different network only sees the global registration
        let got = t.handlers("other", "#chan", "join");
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn wildcard_fallthrough_property() {
        // For any registration and any query where each coordinate matches
        // literally or the registered coordinate is wildcard, the handler
        // is present; otherwise absent.
        let regs = [
            ("net", "", ""),
            ("", "#chan", ""),
            ("", "", "join"),
            ("net", "#chan", "join"),
        ];
        for (rn, rc, re) in regs {
            let t = trie(false);
            t.register(rn, rc, re, "h");
            for (qn, qc, qe) in [
                ("net", "#chan", "join"),
                ("other", "#chan", "join"),
                ("net", "#other", "join"),
                ("net", "#chan", "part"),
            ] {
                let matches = (rn.is_empty() || rn == qn)
                    && (rc.is_empty() || rc == qc)
                    && (re.is_empty() || re == qe);
                let found = !t.handlers(qn, qc, qe).is_empty();
                assert_eq!(found, matches, "reg={:?} query={:?}", (rn, rc, re), (qn, qc, qe));
            }
        }
    }

    #[test]
    fn raw_sentinel_normalizes_to_wildcard_event() {
        let t = trie(false);
        t.register("net", "#chan", "raw", "h");
        assert_eq!(t.handlers("net", "#chan", "anything").len(), 1);
        assert_eq!(t.handlers("net", "#chan", "").len(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let t = trie(false);
        let id = t.register("net", "#chan", "join", "h");
        assert!(t.unregister(id));
        assert!(!t.unregister(id));
    }

    #[test]
    fn unregister_prunes_empty_nodes() {
        let t = trie(false);
        let id = t.register("net", "#chan", "join", "h");
        assert_eq!(t.len(), 1);
        t.unregister(id);
        assert!(t.is_empty());
        // the pruned path must be fully gone, not just empty-but-present
        let inner = t.inner.read();
        assert!(inner.root.is_empty());
    }

    #[test]
    fn exact_ignores_wildcard_registrations() {
        let t = trie(false);
        t.register("net", "", "cmd", "wildcard");
        assert!(t.exact("net", "#chan", "cmd").is_empty());
        t.register("net", "#chan", "cmd", "literal");
        assert_eq!(t.exact("net", "#chan", "cmd").len(), 1);
        assert_eq!(t.handlers("net", "#chan", "cmd").len(), 2);
    }

    #[test]
    fn double_registration_under_distinct_matching_triples_fires_twice() {
        // Open Question in DESIGN.md: this is intentional, not deduplicated.
        let t = trie(false);
        t.register("net", "#chan", "join", "h");
        t.register("net", "", "join", "h");
        assert_eq!(t.handlers("net", "#chan", "join").len(), 2);
    }
}
