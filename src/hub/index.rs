//! Connection index owned by a single hub
//!
//! Connections are grouped per user in a dense vector; every connection
//! also records its position in that vector so removal is a swap-remove
//! followed by re-pointing the element that moved into the hole.

use std::sync::Arc;

use ahash::AHashMap;

use crate::connection::{ConnectionId, WebConn};

#[derive(Debug, Clone)]
struct Slot {
    user_id: Arc<str>,
    position: usize,
}

/// Per-hub registry of live connections
#[derive(Debug, Default)]
pub struct ConnectionIndex {
    by_user: AHashMap<Arc<str>, Vec<Arc<WebConn>>>,
    by_conn: AHashMap<ConnectionId, Slot>,
}

impl ConnectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under its current user id.
    ///
    /// Returns false, leaving the index untouched, if it is already present.
    pub fn add(&mut self, conn: Arc<WebConn>) -> bool {
        if self.by_conn.contains_key(&conn.id()) {
            return false;
        }
        let user_id = conn.user_id();
        let conns = self.by_user.entry(user_id.clone()).or_default();
        self.by_conn.insert(
            conn.id(),
            Slot {
                user_id,
                position: conns.len(),
            },
        );
        conns.push(conn);
        true
    }

    /// Remove a connection, returning it if it was indexed
    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<WebConn>> {
        let slot = self.by_conn.remove(&id)?;
        let conns = self.by_user.get_mut(&slot.user_id)?;

        let removed = conns.swap_remove(slot.position);
        if let Some(moved) = conns.get(slot.position) {
            if let Some(moved_slot) = self.by_conn.get_mut(&moved.id()) {
                moved_slot.position = slot.position;
            }
        }
        if conns.is_empty() {
            self.by_user.remove(&slot.user_id);
        }
        Some(removed)
    }

    pub fn has(&self, id: ConnectionId) -> bool {
        self.by_conn.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Arc<WebConn>> {
        let slot = self.by_conn.get(&id)?;
        self.by_user.get(&slot.user_id)?.get(slot.position)
    }

    /// Connections of one user, in insertion order modulo removals
    pub fn for_user(&self, user_id: &str) -> &[Arc<WebConn>] {
        self.by_user
            .get(user_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Snapshot of every connection; safe to mutate the index while iterating it
    pub fn all(&self) -> Vec<Arc<WebConn>> {
        self.by_user.values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }

    /// Remove and return every connection
    pub fn drain(&mut self) -> Vec<Arc<WebConn>> {
        self.by_conn.clear();
        self.by_user.drain().flat_map(|(_, conns)| conns).collect()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let mut total = 0;
        for (user_id, conns) in &self.by_user {
            assert!(!conns.is_empty(), "empty list left for {}", user_id);
            for (position, conn) in conns.iter().enumerate() {
                let slot = &self.by_conn[&conn.id()];
                assert_eq!(&slot.user_id, user_id);
                assert_eq!(slot.position, position);
            }
            total += conns.len();
        }
        assert_eq!(total, self.by_conn.len());
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::connection::test_support::authed_conn;
    use crate::connection::ConnectionSettings;
    use crate::session::MemorySessionStore;

    fn conns(users: &[&str]) -> Vec<Arc<WebConn>> {
        let store = Arc::new(MemorySessionStore::new());
        users
            .iter()
            .map(|user| authed_conn(&store, user, &[], ConnectionSettings::default()).0)
            .collect()
    }

    #[test]
    fn test_add_remove_has() {
        let mut index = ConnectionIndex::new();
        let c = conns(&["u1"]).remove(0);

        index.add(c.clone());
        assert!(index.has(c.id()));
        assert_eq!(index.len(), 1);

        assert!(index.remove(c.id()).is_some());
        assert!(!index.has(c.id()));
        assert!(index.is_empty());
        assert!(index.for_user("u1").is_empty());

        // second removal is a no-op
        assert!(index.remove(c.id()).is_none());
    }

    #[test]
    fn test_remove_repoints_moved_connection() {
        let mut index = ConnectionIndex::new();
        let cs = conns(&["u1", "u1", "u1"]);
        for c in &cs {
            index.add(c.clone());
        }

        index.remove(cs[0].id());
        index.check_invariants();

        let ids: Vec<_> = index.for_user("u1").iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![cs[2].id(), cs[1].id()]);
        assert_eq!(index.get(cs[2].id()).map(|c| c.id()), Some(cs[2].id()));
    }

    #[test]
    fn test_duplicate_add_ignored() {
        let mut index = ConnectionIndex::new();
        let c = conns(&["u1"]).remove(0);
        assert!(index.add(c.clone()));
        assert!(!index.add(c.clone()));
        assert_eq!(index.len(), 1);
        assert_eq!(index.for_user("u1").len(), 1);
    }

    #[test]
    fn test_all_snapshot_survives_removal() {
        let mut index = ConnectionIndex::new();
        for c in conns(&["u1", "u2", "u2", "u3"]) {
            index.add(c);
        }

        let mut visited = 0;
        for c in index.all() {
            index.remove(c.id());
            visited += 1;
        }
        assert_eq!(visited, 4);
        assert!(index.is_empty());
    }

    #[test]
    fn test_drain() {
        let mut index = ConnectionIndex::new();
        for c in conns(&["u1", "u2"]) {
            index.add(c);
        }
        assert_eq!(index.drain().len(), 2);
        assert!(index.is_empty());
        assert!(index.for_user("u1").is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0..12usize).prop_map(Op::Add), (0..12usize).prop_map(Op::Remove)]
    }

    proptest! {
        #[test]
        fn prop_slots_stay_valid(ops in proptest::collection::vec(op(), 1..200)) {
            let pool = conns(&["a", "a", "a", "b", "b", "c", "d", "d", "d", "d", "e", "f"]);
            let mut index = ConnectionIndex::new();
            let mut present = std::collections::HashSet::new();

            for op in ops {
                match op {
                    Op::Add(i) => {
                        index.add(pool[i].clone());
                        present.insert(i);
                    }
                    Op::Remove(i) => {
                        let removed = index.remove(pool[i].id());
                        prop_assert_eq!(removed.is_some(), present.remove(&i));
                    }
                }
                index.check_invariants();
            }

            prop_assert_eq!(index.len(), present.len());
            for (i, c) in pool.iter().enumerate() {
                prop_assert_eq!(index.has(c.id()), present.contains(&i));
            }
        }
    }
}
