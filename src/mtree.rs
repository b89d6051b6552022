//! MTree: copy-on-write ordered key tree
//!
//! The persistent ordered multimap backing every constraint index: composite
//! key -> chain of row positions. Design:
//!
//! - Each node is wrapped in `Arc`; readers clone the root Arc and traverse
//!   without locks.
//! - Writers use `Arc::make_mut`, which clones a node only if it is shared,
//!   so unmodified subtrees are shared between versions.
//! - `Clone` is O(1): a snapshot is just another reference to the root.
//!
//! The tree is mechanical: it has no constraint awareness. Under
//! [`DuplicatePolicy::Disallow`] a fully-equal key still chains - the Index
//! layer pre-checks with [`MTree::contains`] and raises the uniqueness
//! violation itself.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::core::{IndexKey, Pos};

/// Maximum keys per node. Composite-key comparisons are pricier than the
/// integer case, so nodes are kept smaller than a scalar B-tree would use.
const MAX_KEYS: usize = 32;

/// Minimum keys per node (except root).
const MIN_KEYS: usize = MAX_KEYS / 2;

/// Row positions sharing one key. Two inline slots cover the common case
/// (unique and near-unique indexes) without allocation.
pub type RowChain = SmallVec<[Pos; 2]>;

/// Whether a tree admits multiple rows per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// One row per key (primary/unique indexes)
    #[default]
    Disallow,

    /// Many rows may share a key (foreign-key side, non-unique indexes)
    Allow,
}

/// A B+ tree node (row chains only in leaves)
#[derive(Clone)]
struct Node {
    /// Keys stored in this node
    keys: Vec<IndexKey>,
    /// Row chains (only for leaf nodes, same length as keys)
    chains: Vec<RowChain>,
    /// Child pointers (only for internal nodes, len = keys.len() + 1)
    children: Vec<Arc<Node>>,
}

impl Node {
    fn new_leaf() -> Self {
        Self {
            keys: Vec::with_capacity(8),
            chains: Vec::with_capacity(8),
            children: Vec::new(),
        }
    }

    fn new_internal() -> Self {
        Self {
            keys: Vec::with_capacity(8),
            chains: Vec::new(),
            children: Vec::with_capacity(8),
        }
    }

    #[inline]
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Binary search for key position
    #[inline]
    fn search(&self, key: &IndexKey) -> Result<usize, usize> {
        self.keys.binary_search_by(|k| k.cmp(key))
    }
}

/// What an insert did to the entry population
enum InsertEffect {
    /// A new key was created
    NewKey,
    /// The row id was chained onto an existing key
    Chained,
    /// The (key, row) pair was already present
    AlreadyPresent,
}

enum InsertResult {
    Done(InsertEffect),
    Split(IndexKey, Arc<Node>, InsertEffect),
}

/// What a removal did
enum RemoveEffect {
    /// The key's last row was removed; the key is gone
    KeyRemoved(usize),
    /// One row was unchained; the key remains
    Unchained,
}

/// Copy-on-write ordered key tree
///
/// O(1) clone through structural sharing; ascending iteration; range scans
/// from a partial-key lower bound; `next_key` for auto-increment key
/// generation.
pub struct MTree {
    root: Option<Arc<Node>>,
    policy: DuplicatePolicy,
    /// Number of distinct keys
    key_count: usize,
    /// Number of (key, row) entries
    entry_count: usize,
}

impl Clone for MTree {
    /// O(1) clone - increments the root's reference count
    #[inline]
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            policy: self.policy,
            key_count: self.key_count,
            entry_count: self.entry_count,
        }
    }
}

impl Default for MTree {
    fn default() -> Self {
        Self::new(DuplicatePolicy::Disallow)
    }
}

impl MTree {
    /// Creates an empty tree with the given duplicate policy
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            root: None,
            policy,
            key_count: 0,
            entry_count: 0,
        }
    }

    /// The duplicate policy this tree was built with
    #[inline]
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Number of distinct keys
    #[inline]
    pub fn len(&self) -> usize {
        self.key_count
    }

    /// Number of (key, row) entries (>= len under `Allow`)
    #[inline]
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Returns true if the key is present. Lock-free, O(log n).
    pub fn contains(&self, key: &IndexKey) -> bool {
        self.chain(key).is_some()
    }

    /// First row position for the key, if present
    pub fn get(&self, key: &IndexKey) -> Option<Pos> {
        self.chain(key).and_then(|c| c.first().copied())
    }

    /// All row positions for the key
    pub fn rows_for(&self, key: &IndexKey) -> &[Pos] {
        self.chain(key).map_or(&[], |c| c.as_slice())
    }

    fn chain(&self, key: &IndexKey) -> Option<&RowChain> {
        let mut node = self.root.as_ref()?;
        loop {
            match node.search(key) {
                Ok(i) => {
                    if node.is_leaf() {
                        return Some(&node.chains[i]);
                    }
                    // Separator keys send equal matches right
                    node = &node.children[i + 1];
                }
                Err(i) => {
                    if node.is_leaf() {
                        return None;
                    }
                    node = &node.children[i];
                }
            }
        }
    }

    /// Inserts a (key, row) entry
    ///
    /// Chains the row id when the key already exists, keeping the chain
    /// sorted. Inserting an entry that is already present is a no-op.
    pub fn insert(&mut self, key: IndexKey, row: Pos) {
        let Some(root) = self.root.as_mut() else {
            let mut node = Node::new_leaf();
            node.keys.push(key);
            node.chains.push(SmallVec::from_slice(&[row]));
            self.root = Some(Arc::new(node));
            self.key_count = 1;
            self.entry_count = 1;
            return;
        };

        let result = Self::insert_recursive(root, key, row);
        let effect = match result {
            InsertResult::Done(effect) => effect,
            InsertResult::Split(median, right, effect) => {
                let old_root = self.root.take().unwrap_or_else(|| unreachable!());
                let mut new_root = Node::new_internal();
                new_root.keys.push(median);
                new_root.children.push(old_root);
                new_root.children.push(right);
                self.root = Some(Arc::new(new_root));
                effect
            }
        };

        match effect {
            InsertEffect::NewKey => {
                self.key_count += 1;
                self.entry_count += 1;
            }
            InsertEffect::Chained => self.entry_count += 1,
            InsertEffect::AlreadyPresent => {}
        }
    }

    fn insert_recursive(node_arc: &mut Arc<Node>, key: IndexKey, row: Pos) -> InsertResult {
        // COW: clone the node if it is shared with a snapshot
        let node = Arc::make_mut(node_arc);

        if node.is_leaf() {
            match node.search(&key) {
                Ok(i) => {
                    let chain = &mut node.chains[i];
                    match chain.binary_search(&row) {
                        Ok(_) => InsertResult::Done(InsertEffect::AlreadyPresent),
                        Err(pos) => {
                            chain.insert(pos, row);
                            InsertResult::Done(InsertEffect::Chained)
                        }
                    }
                }
                Err(i) => {
                    node.keys.insert(i, key);
                    node.chains.insert(i, SmallVec::from_slice(&[row]));

                    if node.keys.len() > MAX_KEYS {
                        let (median, right) = Self::split_leaf(node);
                        InsertResult::Split(median, Arc::new(right), InsertEffect::NewKey)
                    } else {
                        InsertResult::Done(InsertEffect::NewKey)
                    }
                }
            }
        } else {
            let i = match node.search(&key) {
                Ok(i) => i + 1,
                Err(i) => i,
            };

            match Self::insert_recursive(&mut node.children[i], key, row) {
                InsertResult::Done(effect) => InsertResult::Done(effect),
                InsertResult::Split(median, right, effect) => {
                    node.keys.insert(i, median);
                    node.children.insert(i + 1, right);

                    if node.keys.len() > MAX_KEYS {
                        let (m, r) = Self::split_internal(node);
                        InsertResult::Split(m, Arc::new(r), effect)
                    } else {
                        InsertResult::Done(effect)
                    }
                }
            }
        }
    }

    /// Split a leaf node. Returns (median_key, right_node).
    fn split_leaf(node: &mut Node) -> (IndexKey, Node) {
        let mid = node.keys.len() / 2;

        let right_keys: Vec<IndexKey> = node.keys.drain(mid..).collect();
        let right_chains: Vec<RowChain> = node.chains.drain(mid..).collect();

        let median = right_keys[0].clone();
        let right = Node {
            keys: right_keys,
            chains: right_chains,
            children: Vec::new(),
        };

        (median, right)
    }

    fn split_internal(node: &mut Node) -> (IndexKey, Node) {
        let mid = node.keys.len() / 2;

        let right_keys: Vec<IndexKey> = node.keys.drain(mid + 1..).collect();
        let median = match node.keys.pop() {
            Some(k) => k,
            None => unreachable!("split of undersized internal node"),
        };
        let right_children: Vec<Arc<Node>> = node.children.drain(mid + 1..).collect();

        let right = Node {
            keys: right_keys,
            chains: Vec::new(),
            children: right_children,
        };

        (median, right)
    }

    /// Removes one (key, row) entry. Absent entries are a no-op.
    ///
    /// Returns true if an entry was removed.
    pub fn remove(&mut self, key: &IndexKey, row: Pos) -> bool {
        self.remove_inner(key, Some(row))
    }

    /// Removes a key with its whole chain. Absent keys are a no-op.
    pub fn remove_key(&mut self, key: &IndexKey) -> bool {
        self.remove_inner(key, None)
    }

    fn remove_inner(&mut self, key: &IndexKey, row: Option<Pos>) -> bool {
        let Some(root) = self.root.as_mut() else {
            return false;
        };

        let effect = Self::remove_recursive(root, key, row);
        match effect {
            None => false,
            Some(RemoveEffect::Unchained) => {
                self.entry_count -= 1;
                true
            }
            Some(RemoveEffect::KeyRemoved(chain_len)) => {
                self.key_count -= 1;
                self.entry_count -= chain_len;

                if self.key_count == 0 {
                    self.root = None;
                    return true;
                }

                // Collapse an empty internal root onto its only child
                if let Some(root) = &self.root {
                    if !root.is_leaf() && root.keys.is_empty() && root.children.len() == 1 {
                        let child = root.children[0].clone();
                        self.root = Some(child);
                    }
                }
                true
            }
        }
    }

    fn remove_recursive(
        node_arc: &mut Arc<Node>,
        key: &IndexKey,
        row: Option<Pos>,
    ) -> Option<RemoveEffect> {
        let node = Arc::make_mut(node_arc);

        if node.is_leaf() {
            match node.search(key) {
                Ok(i) => {
                    if let Some(row) = row {
                        let chain = &mut node.chains[i];
                        let pos = chain.binary_search(&row).ok()?;
                        chain.remove(pos);
                        if chain.is_empty() {
                            node.keys.remove(i);
                            node.chains.remove(i);
                            Some(RemoveEffect::KeyRemoved(1))
                        } else {
                            Some(RemoveEffect::Unchained)
                        }
                    } else {
                        node.keys.remove(i);
                        let chain = node.chains.remove(i);
                        Some(RemoveEffect::KeyRemoved(chain.len()))
                    }
                }
                Err(_) => None,
            }
        } else {
            let i = match node.search(key) {
                Ok(i) => i + 1,
                Err(i) => i,
            };

            // Pre-emptive rebalance: make sure the child can lose a key
            if node.children[i].keys.len() <= MIN_KEYS {
                Self::ensure_child_can_lose_key(node, i);
            }

            // Rebalancing may have moved the key; recompute the index
            let i = match node.search(key) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            let i = i.min(node.children.len() - 1);

            Self::remove_recursive(&mut node.children[i], key, row)
        }
    }

    fn ensure_child_can_lose_key(node: &mut Node, i: usize) {
        let can_borrow_left = i > 0 && node.children[i - 1].keys.len() > MIN_KEYS;
        let can_borrow_right =
            i < node.children.len() - 1 && node.children[i + 1].keys.len() > MIN_KEYS;

        if can_borrow_left {
            Self::borrow_from_left(node, i);
        } else if can_borrow_right {
            Self::borrow_from_right(node, i);
        } else if i > 0 {
            Self::merge_with_left(node, i);
        } else if i < node.children.len() - 1 {
            Self::merge_with_right(node, i);
        }
    }

    fn borrow_from_left(node: &mut Node, i: usize) {
        let is_leaf = node.children[i - 1].is_leaf();
        let (borrowed_key, borrowed_chain, borrowed_child) = {
            let left = Arc::make_mut(&mut node.children[i - 1]);
            let key = left.keys.pop().unwrap_or_else(|| unreachable!());
            let chain = if is_leaf { left.chains.pop() } else { None };
            let child = if !is_leaf { left.children.pop() } else { None };
            (key, chain, child)
        };

        let child = Arc::make_mut(&mut node.children[i]);
        if is_leaf {
            child.keys.insert(0, borrowed_key);
            child
                .chains
                .insert(0, borrowed_chain.unwrap_or_else(|| unreachable!()));
            // Separator becomes the new first key of the child
            node.keys[i - 1] = child.keys[0].clone();
        } else {
            let separator = std::mem::replace(&mut node.keys[i - 1], borrowed_key);
            child.keys.insert(0, separator);
            child
                .children
                .insert(0, borrowed_child.unwrap_or_else(|| unreachable!()));
        }
    }

    fn borrow_from_right(node: &mut Node, i: usize) {
        let is_leaf = node.children[i + 1].is_leaf();
        let (borrowed_key, borrowed_chain, borrowed_child, new_separator) = {
            let right = Arc::make_mut(&mut node.children[i + 1]);
            let key = right.keys.remove(0);
            let chain = if is_leaf {
                Some(right.chains.remove(0))
            } else {
                None
            };
            let child = if !is_leaf {
                Some(right.children.remove(0))
            } else {
                None
            };
            let new_sep = if is_leaf {
                right.keys[0].clone()
            } else {
                key.clone()
            };
            (key, chain, child, new_sep)
        };

        let child = Arc::make_mut(&mut node.children[i]);
        if is_leaf {
            child.keys.push(borrowed_key);
            child
                .chains
                .push(borrowed_chain.unwrap_or_else(|| unreachable!()));
            node.keys[i] = new_separator;
        } else {
            let separator = std::mem::replace(&mut node.keys[i], new_separator);
            child.keys.push(separator);
            child
                .children
                .push(borrowed_child.unwrap_or_else(|| unreachable!()));
        }
    }

    fn merge_with_left(node: &mut Node, i: usize) {
        let separator = node.keys.remove(i - 1);
        let right = node.children.remove(i);

        let left = Arc::make_mut(&mut node.children[i - 1]);

        if !left.is_leaf() {
            left.keys.push(separator);
        }

        left.keys.extend(right.keys.iter().cloned());
        left.chains.extend(right.chains.iter().cloned());
        left.children.extend(right.children.iter().cloned());
    }

    fn merge_with_right(node: &mut Node, i: usize) {
        let separator = node.keys.remove(i);
        let right = node.children.remove(i + 1);

        let left = Arc::make_mut(&mut node.children[i]);

        if !left.is_leaf() {
            left.keys.push(separator);
        }

        left.keys.extend(right.keys.iter().cloned());
        left.chains.extend(right.chains.iter().cloned());
        left.children.extend(right.children.iter().cloned());
    }

    /// First (lowest) key and its row chain
    pub fn first(&self) -> Option<(&IndexKey, &[Pos])> {
        let mut node = self.root.as_ref()?;
        loop {
            if node.is_leaf() {
                let key = node.keys.first()?;
                return Some((key, node.chains[0].as_slice()));
            }
            node = node.children.first()?;
        }
    }

    /// Last (highest) key and its row chain
    pub fn last(&self) -> Option<(&IndexKey, &[Pos])> {
        let mut node = self.root.as_ref()?;
        loop {
            if node.is_leaf() {
                let key = node.keys.last()?;
                return Some((key, node.chains.last()?.as_slice()));
            }
            node = node.children.last()?;
        }
    }

    /// Ascending iteration over all (key, chain) pairs
    ///
    /// Restartable: calling `iter` again yields the same sequence as long
    /// as the tree value is unchanged.
    pub fn iter(&self) -> TreeIter<'_> {
        TreeIter::new(self.root.as_deref(), None)
    }

    /// Ascending iteration starting at the first key >= `lower`
    ///
    /// `lower` may be a partial (prefix) key: prefixes sort before any full
    /// key that extends them, so a prefix bound lands the cursor on the
    /// first extension.
    pub fn range_from<'a>(&'a self, lower: &IndexKey) -> TreeIter<'a> {
        TreeIter::new(self.root.as_deref(), Some(lower))
    }

    /// Ascending iteration over the keys extending `prefix`
    pub fn range_prefix<'a>(
        &'a self,
        prefix: &'a IndexKey,
    ) -> impl Iterator<Item = (&'a IndexKey, &'a [Pos])> {
        self.range_from(prefix)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Next auto-increment value for the key column at `col_ix`
    ///
    /// Among entries whose key starts with `prefix`, finds the maximum
    /// integer value of column `col_ix` and returns one more; 0 when no
    /// entry shares the prefix.
    pub fn next_key(&self, prefix: &IndexKey, col_ix: usize) -> i64 {
        let mut max: Option<i64> = None;
        for (key, _) in self.range_prefix(prefix) {
            if let Some(v) = key.0.get(col_ix).and_then(|v| v.as_int64()) {
                max = Some(max.map_or(v, |m| m.max(v)));
            }
        }
        max.map_or(0, |m| m + 1)
    }
}

impl std::fmt::Debug for MTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MTree")
            .field("policy", &self.policy)
            .field("keys", &self.key_count)
            .field("entries", &self.entry_count)
            .finish()
    }
}

/// Forward cursor over tree entries in ascending key order
pub struct TreeIter<'a> {
    /// Stack of (internal node, next child index)
    stack: Vec<(&'a Node, usize)>,
    current_leaf: Option<&'a Node>,
    current_idx: usize,
}

impl<'a> TreeIter<'a> {
    fn new(root: Option<&'a Node>, lower: Option<&IndexKey>) -> Self {
        let mut iter = Self {
            stack: Vec::new(),
            current_leaf: None,
            current_idx: 0,
        };
        if let Some(root) = root {
            match lower {
                Some(bound) => iter.seek(root, bound),
                None => iter.descend_to_leftmost(root),
            }
        }
        iter
    }

    fn descend_to_leftmost(&mut self, mut node: &'a Node) {
        while !node.is_leaf() {
            self.stack.push((node, 1));
            node = &node.children[0];
        }
        self.current_leaf = Some(node);
        self.current_idx = 0;
    }

    fn seek(&mut self, mut node: &'a Node, bound: &IndexKey) {
        loop {
            if node.is_leaf() {
                let idx = match node.search(bound) {
                    Ok(i) => i,
                    Err(i) => i,
                };
                self.current_leaf = Some(node);
                self.current_idx = idx;
                return;
            }
            let idx = match node.search(bound) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            self.stack.push((node, idx + 1));
            node = &node.children[idx];
        }
    }
}

impl<'a> Iterator for TreeIter<'a> {
    type Item = (&'a IndexKey, &'a [Pos]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(leaf) = self.current_leaf {
                if self.current_idx < leaf.keys.len() {
                    let i = self.current_idx;
                    self.current_idx += 1;
                    return Some((&leaf.keys[i], leaf.chains[i].as_slice()));
                }
                self.current_leaf = None;
            }

            // Exhausted the leaf: find the next one from the stack
            let (node, idx) = self.stack.last_mut()?;
            let node: &'a Node = *node;
            if *idx < node.children.len() {
                let child_idx = *idx;
                *idx += 1;
                self.descend_to_leftmost(&node.children[child_idx]);
            } else {
                self.stack.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn ik(vals: &[i64]) -> IndexKey {
        IndexKey::new(vals.iter().map(|&v| Value::integer(v)).collect())
    }

    #[test]
    fn test_insert_get_contains() {
        let mut tree = MTree::new(DuplicatePolicy::Disallow);

        tree.insert(ik(&[5]), 100);
        tree.insert(ik(&[3]), 101);
        tree.insert(ik(&[7]), 102);

        assert!(tree.contains(&ik(&[5])));
        assert_eq!(tree.get(&ik(&[3])), Some(101));
        assert_eq!(tree.get(&ik(&[9])), None);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.entry_count(), 3);
    }

    #[test]
    fn test_insert_then_remove_absent() {
        let mut tree = MTree::new(DuplicatePolicy::Disallow);

        tree.insert(ik(&[1]), 10);
        assert!(tree.remove(&ik(&[1]), 10));
        assert!(!tree.contains(&ik(&[1])));
        assert!(tree.is_empty());

        // Absent key removal is a no-op, not an error
        assert!(!tree.remove(&ik(&[1]), 10));
        assert!(!tree.remove_key(&ik(&[42])));
    }

    #[test]
    fn test_duplicate_chaining() {
        let mut tree = MTree::new(DuplicatePolicy::Allow);

        tree.insert(ik(&[5]), 100);
        tree.insert(ik(&[5]), 200);
        tree.insert(ik(&[5]), 150);

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.entry_count(), 3);
        assert_eq!(tree.rows_for(&ik(&[5])), &[100, 150, 200]);
        // First of chain
        assert_eq!(tree.get(&ik(&[5])), Some(100));

        // Removing one entry keeps the others
        assert!(tree.remove(&ik(&[5]), 150));
        assert_eq!(tree.rows_for(&ik(&[5])), &[100, 200]);
        assert_eq!(tree.entry_count(), 2);

        // Re-inserting an identical entry is a no-op
        tree.insert(ik(&[5]), 100);
        assert_eq!(tree.entry_count(), 2);
    }

    #[test]
    fn test_snapshot_isolation() {
        let mut tree = MTree::new(DuplicatePolicy::Disallow);
        for i in 0..200 {
            tree.insert(ik(&[i]), i);
        }

        let snapshot = tree.clone();

        tree.insert(ik(&[500]), 500);
        tree.remove(&ik(&[50]), 50);

        // Snapshot is unaffected
        assert!(snapshot.contains(&ik(&[50])));
        assert!(!snapshot.contains(&ik(&[500])));
        assert_eq!(snapshot.len(), 200);

        // Mutated value sees its own changes
        assert!(!tree.contains(&ik(&[50])));
        assert!(tree.contains(&ik(&[500])));
    }

    #[test]
    fn test_iteration_sorted_and_restartable() {
        let mut tree = MTree::new(DuplicatePolicy::Disallow);
        let keys = [5i64, 2, 8, 1, 9, 3, 7, 4, 6, 0];
        for &k in &keys {
            tree.insert(ik(&[k]), k * 10);
        }

        let first: Vec<i64> = tree
            .iter()
            .map(|(k, _)| k.0[0].as_int64().unwrap())
            .collect();
        assert_eq!(first, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

        // Restarting yields the identical sequence
        let second: Vec<i64> = tree
            .iter()
            .map(|(k, _)| k.0[0].as_int64().unwrap())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_many_inserts_and_removals() {
        let mut tree = MTree::new(DuplicatePolicy::Disallow);

        // Pseudo-random insert order to exercise splits
        let keys: Vec<i64> = (0..2000).map(|i| (i * 7919 + 13) % 10000).collect();
        for &k in &keys {
            tree.insert(ik(&[k]), k);
        }

        for &k in &keys {
            assert_eq!(tree.get(&ik(&[k])), Some(k), "missing key {}", k);
        }

        // Remove every other key to exercise borrows and merges
        for &k in keys.iter().step_by(2) {
            assert!(tree.remove(&ik(&[k]), k));
        }
        for (i, &k) in keys.iter().enumerate() {
            if i % 2 == 0 {
                assert!(!tree.contains(&ik(&[k])));
            } else {
                assert!(tree.contains(&ik(&[k])));
            }
        }

        // Survivors still iterate in order
        let survivors: Vec<i64> = tree
            .iter()
            .map(|(k, _)| k.0[0].as_int64().unwrap())
            .collect();
        let mut expected: Vec<i64> = keys.iter().skip(1).step_by(2).copied().collect();
        expected.sort_unstable();
        assert_eq!(survivors, expected);
    }

    #[test]
    fn test_range_from_partial_key() {
        let mut tree = MTree::new(DuplicatePolicy::Allow);
        for a in 1..=3i64 {
            for b in 1..=3i64 {
                tree.insert(ik(&[a, b]), a * 10 + b);
            }
        }

        // Prefix [2] lands on the first key extending it
        let from_two: Vec<Pos> = tree.range_from(&ik(&[2])).map(|(_, c)| c[0]).collect();
        assert_eq!(from_two, vec![21, 22, 23, 31, 32, 33]);

        let only_two: Vec<Pos> = tree.range_prefix(&ik(&[2])).map(|(_, c)| c[0]).collect();
        assert_eq!(only_two, vec![21, 22, 23]);
    }

    #[test]
    fn test_first_last() {
        let mut tree = MTree::new(DuplicatePolicy::Disallow);
        assert!(tree.first().is_none());

        for k in [4i64, 2, 9, 7] {
            tree.insert(ik(&[k]), k);
        }
        assert_eq!(tree.first().unwrap().0, &ik(&[2]));
        assert_eq!(tree.last().unwrap().0, &ik(&[9]));
    }

    #[test]
    fn test_next_key() {
        let mut tree = MTree::new(DuplicatePolicy::Disallow);

        // Empty prefix group: starts at zero
        assert_eq!(tree.next_key(&ik(&[7]), 1), 0);

        tree.insert(ik(&[7, 0]), 100);
        tree.insert(ik(&[7, 1]), 101);
        tree.insert(ik(&[7, 5]), 102);
        tree.insert(ik(&[8, 90]), 103);

        // Max among the [7, _] group is 5; unrelated prefixes don't count
        assert_eq!(tree.next_key(&ik(&[7]), 1), 6);
        assert_eq!(tree.next_key(&ik(&[8]), 1), 91);
        assert_eq!(tree.next_key(&ik(&[9]), 1), 0);

        // The returned value is never already present
        let next = tree.next_key(&ik(&[7]), 1);
        assert!(!tree.contains(&ik(&[7, next])));
    }

    #[test]
    fn test_null_sorts_low_in_tree() {
        use crate::core::DataType;

        let mut tree = MTree::new(DuplicatePolicy::Allow);
        tree.insert(IndexKey::new(vec![Value::integer(1)]), 1);
        tree.insert(IndexKey::new(vec![Value::null(DataType::Integer)]), 2);
        tree.insert(IndexKey::new(vec![Value::integer(-5)]), 3);

        let order: Vec<Pos> = tree.iter().map(|(_, c)| c[0]).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }
}
