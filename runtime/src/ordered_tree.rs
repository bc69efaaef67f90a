//! A balanced ordered container keyed by a user comparator, ported from the
//! "AA-tree" (Arne Andersson tree) used for `UA_Timer`'s two indices and for
//! a TCP ConnectionManager's fd table.
//!
//! The original C structure is intrusive: the tree head stores byte offsets
//! from a container struct to an embedded `aa_entry` link and to the key
//! field, so a single generic tree type can order arbitrary containers
//! without allocating per-node metadata. Rust has no stable offset-of for
//! that trick, so this is instead an arena of slots addressed by `NodeId`;
//! the caller's payload lives inside the slot rather than beside it, and
//! insertion/removal only ever touch the arena, never allocate per call
//! beyond occasional `Vec` growth (see Design Notes).
//!
//! Ties in the primary key are broken by `NodeId`, giving every entry a
//! stable total order even when multiple entries share a primary key (e.g.
//! timer entries with the same deadline) — the `NodeId` here plays the role
//! the original plays with the entry's memory address.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

struct Slot<K> {
    left: Option<NodeId>,
    right: Option<NodeId>,
    level: u32,
    key: K,
}

/// An intrusive-style AA-tree arena, ordered by `K: Ord` with `NodeId`
/// tie-breaking. `find` returns the first key match encountered during
/// descent; callers wanting every match enumerate from `min`/`next`.
pub struct OrderedTree<K: Ord> {
    slots: Vec<Slot<K>>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
    len: usize,
}

impl<K: Ord> OrderedTree<K> {
    pub fn new() -> Self {
        OrderedTree { slots: Vec::new(), free: Vec::new(), root: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, id: NodeId) -> &K {
        &self.slots[id.idx()].key
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut K {
        &mut self.slots[id.idx()].key
    }

    /// Inserts `key`, returning the `NodeId` it was stored at. O(log n),
    /// no allocation beyond an occasional arena growth.
    pub fn insert(&mut self, key: K) -> NodeId {
        let id = self.alloc(key);
        self.root = self.insert_rec(self.root, id);
        self.len += 1;
        id
    }

    /// Removes the node previously returned by `insert`. No-op if the id
    /// was already removed (matches the original's tolerance for a caller
    /// holding a stale reference it never double-frees in practice, but
    /// defends against it regardless).
    pub fn remove(&mut self, id: NodeId) {
        if !self.contains(id) {
            return;
        }
        let mut last = None;
        let mut deleted = None;
        let mut unlinked = None;
        self.root = self.remove_rec(self.root, id, &mut last, &mut deleted, &mut unlinked);
        // `id`'s key may have been swapped down to its in-order successor
        // (see `remove_rec`), in which case `id` is still rooted and the
        // successor's slot is the one physically spliced out. Free whatever
        // `remove_rec` actually unlinked, not `id` itself.
        if let Some(freed) = unlinked {
            self.free.push(freed);
        }
        self.len -= 1;
    }

    /// Returns the first node whose key compares `Equal` to `key`.
    pub fn find(&self, key: &K) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            let node = &self.slots[id.idx()];
            match key.cmp(&node.key) {
                Ordering::Less => cur = node.left,
                Ordering::Greater => cur = node.right,
                Ordering::Equal => return Some(id),
            }
        }
        None
    }

    pub fn min(&self) -> Option<NodeId> {
        self.root.map(|r| self.min_from(r))
    }

    pub fn max(&self) -> Option<NodeId> {
        self.root.map(|r| self.max_from(r))
    }

    /// In-order successor of `id`. O(log n); no parent pointers are stored,
    /// so an ancestor search from the root substitutes for the usual
    /// parent-chain walk.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        if let Some(r) = self.slots[id.idx()].right {
            return Some(self.min_from(r));
        }
        let mut candidate = None;
        let mut cur = self.root;
        while let Some(cur_id) = cur {
            match self.full_cmp_ids(id, cur_id) {
                Ordering::Less => {
                    candidate = Some(cur_id);
                    cur = self.slots[cur_id.idx()].left;
                }
                Ordering::Greater => cur = self.slots[cur_id.idx()].right,
                Ordering::Equal => break,
            }
        }
        candidate
    }

    /// In-order predecessor of `id`.
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        if let Some(l) = self.slots[id.idx()].left {
            return Some(self.max_from(l));
        }
        let mut candidate = None;
        let mut cur = self.root;
        while let Some(cur_id) = cur {
            match self.full_cmp_ids(id, cur_id) {
                Ordering::Greater => {
                    candidate = Some(cur_id);
                    cur = self.slots[cur_id.idx()].right;
                }
                Ordering::Less => cur = self.slots[cur_id.idx()].left,
                Ordering::Equal => break,
            }
        }
        candidate
    }

    fn contains(&self, id: NodeId) -> bool {
        id.idx() < self.slots.len() && !self.free.contains(&id)
    }

    fn alloc(&mut self, key: K) -> NodeId {
        let slot = Slot { left: None, right: None, level: 1, key };
        if let Some(id) = self.free.pop() {
            self.slots[id.idx()] = slot;
            id
        } else {
            self.slots.push(slot);
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    fn min_from(&self, mut id: NodeId) -> NodeId {
        while let Some(l) = self.slots[id.idx()].left {
            id = l;
        }
        id
    }

    fn max_from(&self, mut id: NodeId) -> NodeId {
        while let Some(r) = self.slots[id.idx()].right {
            id = r;
        }
        id
    }

    fn full_cmp_ids(&self, a: NodeId, b: NodeId) -> Ordering {
        let ka = &self.slots[a.idx()].key;
        let kb = &self.slots[b.idx()].key;
        match ka.cmp(kb) {
            Ordering::Equal => a.cmp(&b),
            other => other,
        }
    }

    #[inline]
    fn level(&self, t: Option<NodeId>) -> u32 {
        t.map(|id| self.slots[id.idx()].level).unwrap_or(0)
    }

    /// Right rotation restoring the AA-tree invariant "no left child has
    /// the same level as its parent".
    fn skew(&mut self, t: Option<NodeId>) -> Option<NodeId> {
        let t_id = t?;
        let l_id = self.slots[t_id.idx()].left?;
        if self.slots[l_id.idx()].level != self.slots[t_id.idx()].level {
            return Some(t_id);
        }
        let l_right = self.slots[l_id.idx()].right;
        self.slots[t_id.idx()].left = l_right;
        self.slots[l_id.idx()].right = Some(t_id);
        Some(l_id)
    }

    /// Left rotation restoring the AA-tree invariant "no two consecutive
    /// right links at the same level".
    fn split(&mut self, t: Option<NodeId>) -> Option<NodeId> {
        let t_id = t?;
        let r_id = match self.slots[t_id.idx()].right {
            Some(r) => r,
            None => return Some(t_id),
        };
        let rr_level = self.level(self.slots[r_id.idx()].right);
        if rr_level != self.slots[t_id.idx()].level {
            return Some(t_id);
        }
        let r_left = self.slots[r_id.idx()].left;
        self.slots[t_id.idx()].right = r_left;
        self.slots[r_id.idx()].left = Some(t_id);
        self.slots[r_id.idx()].level += 1;
        Some(r_id)
    }

    fn insert_rec(&mut self, t: Option<NodeId>, new_id: NodeId) -> Option<NodeId> {
        let t_id = match t {
            None => return Some(new_id),
            Some(id) => id,
        };

        match self.full_cmp_ids(new_id, t_id) {
            Ordering::Less => {
                let left = self.slots[t_id.idx()].left;
                let new_left = self.insert_rec(left, new_id);
                self.slots[t_id.idx()].left = new_left;
            }
            _ => {
                let right = self.slots[t_id.idx()].right;
                let new_right = self.insert_rec(right, new_id);
                self.slots[t_id.idx()].right = new_right;
            }
        }

        let t = self.skew(Some(t_id));
        self.split(t)
    }

    /// Deletion by node identity, following the standard AA-tree algorithm:
    /// descend comparing the full (key, id) order; the node matching `target`
    /// is swapped with its in-order successor (the first leaf-ish node
    /// reached afterwards) and the successor slot is the one physically
    /// unlinked, then levels are repaired back up the path. The physically
    /// unlinked id (the successor's slot when a swap happened, `target`
    /// itself otherwise) is reported through `unlinked` so the caller frees
    /// the right slot even when `target` stays rooted under a new key.
    fn remove_rec(
        &mut self,
        t: Option<NodeId>,
        target: NodeId,
        last: &mut Option<NodeId>,
        deleted: &mut Option<NodeId>,
        unlinked: &mut Option<NodeId>,
    ) -> Option<NodeId> {
        let t_id = match t {
            None => return None,
            Some(id) => id,
        };

        *last = Some(t_id);

        match self.full_cmp_ids(target, t_id) {
            Ordering::Less => {
                let left = self.slots[t_id.idx()].left;
                let new_left = self.remove_rec(left, target, last, deleted, unlinked);
                self.slots[t_id.idx()].left = new_left;
            }
            _ => {
                *deleted = Some(t_id);
                let right = self.slots[t_id.idx()].right;
                let new_right = self.remove_rec(right, target, last, deleted, unlinked);
                self.slots[t_id.idx()].right = new_right;
            }
        }

        let mut t_id = t_id;

        if *last == Some(t_id) {
            if let Some(del_id) = *deleted {
                if del_id != t_id {
                    self.swap_key(del_id, t_id);
                }
                *deleted = None;
                *unlinked = Some(t_id);
                return self.slots[t_id.idx()].right;
            }
            return Some(t_id);
        }

        let left_level = self.level(self.slots[t_id.idx()].left);
        let right_level = self.level(self.slots[t_id.idx()].right);
        let my_level = self.slots[t_id.idx()].level;

        if left_level < my_level.saturating_sub(1) || right_level < my_level.saturating_sub(1) {
            let new_level = my_level - 1;
            self.slots[t_id.idx()].level = new_level;
            if right_level > new_level {
                if let Some(r) = self.slots[t_id.idx()].right {
                    self.slots[r.idx()].level = new_level;
                }
            }

            t_id = self.skew(Some(t_id)).unwrap();
            if let Some(r) = self.slots[t_id.idx()].right {
                let new_r = self.skew(Some(r));
                self.slots[t_id.idx()].right = new_r;
                if let Some(r) = self.slots[t_id.idx()].right {
                    if let Some(rr) = self.slots[r.idx()].right {
                        let new_rr = self.skew(Some(rr));
                        self.slots[r.idx()].right = new_rr;
                    }
                }
            }
            t_id = self.split(Some(t_id)).unwrap();
            if let Some(r) = self.slots[t_id.idx()].right {
                let new_r = self.split(Some(r));
                self.slots[t_id.idx()].right = new_r;
            }
        }

        Some(t_id)
    }

    fn swap_key(&mut self, a: NodeId, b: NodeId) {
        let (ai, bi) = (a.idx(), b.idx());
        if ai == bi {
            return;
        }
        let (lo, hi) = if ai < bi { (ai, bi) } else { (bi, ai) };
        let (left, right) = self.slots.split_at_mut(hi);
        std::mem::swap(&mut left[lo].key, &mut right[0].key);
    }

    /// In-order iteration, for tests and small enumerations. Not
    /// allocation-free; not used on any hot path.
    pub fn iter_inorder(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut cur = self.min();
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.next(id);
            Some(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_find() {
        let mut tree = OrderedTree::new();
        let a = tree.insert(10);
        let b = tree.insert(5);
        let c = tree.insert(20);

        assert_eq!(tree.len(), 3);
        assert_eq!(tree.find(&5), Some(b));
        assert_eq!(tree.find(&10), Some(a));
        assert_eq!(tree.find(&20), Some(c));
        assert_eq!(tree.find(&999), None);
    }

    #[test]
    fn min_max_and_inorder_traversal() {
        let mut tree = OrderedTree::new();
        for v in [50, 10, 90, 30, 70, 20, 80, 40, 60] {
            tree.insert(v);
        }

        let min_id = tree.min().unwrap();
        assert_eq!(*tree.get(min_id), 10);
        let max_id = tree.max().unwrap();
        assert_eq!(*tree.get(max_id), 90);

        let values: Vec<i32> = tree.iter_inorder().map(|id| *tree.get(id)).collect();
        assert_eq!(values, vec![10, 20, 30, 40, 50, 60, 70, 80, 90]);
    }

    #[test]
    fn duplicate_keys_coexist_in_stable_order() {
        let mut tree = OrderedTree::new();
        let first = tree.insert(100);
        let second = tree.insert(100);
        let third = tree.insert(100);

        assert_eq!(tree.len(), 3);
        // All three share the primary key but are distinct nodes.
        let ordered: Vec<NodeId> = tree.iter_inorder().collect();
        assert_eq!(ordered, vec![first, second, third]);
    }

    #[test]
    fn remove_preserves_ordering_of_survivors() {
        let mut tree = OrderedTree::new();
        let ids: Vec<NodeId> = (0..20).map(|v| tree.insert(v)).collect();

        // Remove every other entry.
        for id in ids.iter().step_by(2) {
            tree.remove(*id);
        }
        assert_eq!(tree.len(), 10);

        let values: Vec<i32> = tree.iter_inorder().map(|id| *tree.get(id)).collect();
        let expected: Vec<i32> = (0..20).filter(|v| v % 2 == 1).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn remove_all_leaves_empty_tree() {
        let mut tree = OrderedTree::new();
        let ids: Vec<NodeId> = (0..50).map(|v| tree.insert(v)).collect();
        for id in ids {
            tree.remove(id);
        }
        assert!(tree.is_empty());
        assert_eq!(tree.min(), None);
    }

    #[test]
    fn next_and_prev_walk_in_order() {
        let mut tree = OrderedTree::new();
        let ids: Vec<NodeId> = [3, 1, 4, 1, 5, 9, 2, 6].iter().map(|&v| tree.insert(v)).collect();

        let first = tree.min().unwrap();
        let mut forward = vec![*tree.get(first)];
        let mut cur = first;
        while let Some(n) = tree.next(cur) {
            forward.push(*tree.get(n));
            cur = n;
        }
        let mut sorted: Vec<i32> = [3, 1, 4, 1, 5, 9, 2, 6].to_vec();
        sorted.sort();
        assert_eq!(forward, sorted);

        // prev() from the last node walks back down to the first.
        let last = tree.max().unwrap();
        let mut backward = vec![*tree.get(last)];
        let mut cur = last;
        while let Some(p) = tree.prev(cur) {
            backward.push(*tree.get(p));
            cur = p;
        }
        sorted.reverse();
        assert_eq!(backward, sorted);

        drop(ids);
    }

    #[test]
    fn remove_frees_the_physically_unlinked_slot_not_the_swapped_key_holder() {
        // Two inserts put a horizontal right link from the root to the
        // second node; deleting the root swaps its key down rather than
        // unlinking the root's own slot. Recycling that slot must not
        // leave the still-rooted node pointing at itself.
        let mut tree = OrderedTree::new();
        let first = tree.insert(10);
        tree.insert(20);
        tree.remove(first);

        tree.insert(5);
        assert_eq!(tree.len(), 2);

        // A self-cycle in the recycled slot would hang this traversal.
        let values: Vec<i32> = tree.iter_inorder().map(|id| *tree.get(id)).collect();
        assert_eq!(values, vec![5, 20]);
    }

    #[test]
    fn removed_slots_are_recycled() {
        let mut tree = OrderedTree::new();
        let a = tree.insert(1);
        tree.remove(a);
        let b = tree.insert(2);
        // The arena slot is reused, but that's an internal detail; what
        // matters is the tree stays correct.
        assert_eq!(tree.len(), 1);
        assert_eq!(*tree.get(b), 2);
    }
}
