//! Generic copy-on-write B+ tree (§3).
//!
//! Keys are raw byte strings compared lexicographically; callers encode
//! whatever ordering they need into the bytes (name-hash-prefixed for
//! directory entries, raw big-endian block index for file-block entries, so
//! the latter stay numerically ordered). All values live in leaves; internal
//! nodes hold only routing information. Rebalancing is driven by a node's own
//! serialized byte size against [`TreeLimits`](crate::config::TreeLimits),
//! not by child count.

mod node;

pub use node::{is_empty, new_root, NodeRef, TreeLeaf};

use node::{set_parent, Child, TreeNode};
use std::rc::Rc;

/// A snapshot of one node's direct children, for (de)serialization: either
/// every child is a leaf, or every child is a sub-node (never mixed).
pub enum ChildrenView<L: TreeLeaf> {
    Leaves(Vec<L>),
    Nodes(Vec<NodeRef<L>>),
}

pub fn children_view<L: TreeLeaf>(node: &NodeRef<L>) -> ChildrenView<L> {
    let n = node.borrow();
    if n.is_leaf_level() {
        ChildrenView::Leaves(
            n.children
                .iter()
                .map(|c| match c {
                    Child::Leaf(l) => l.clone(),
                    Child::Node(_) => unreachable!("leaf-level node holds only leaves"),
                })
                .collect(),
        )
    } else {
        ChildrenView::Nodes(n.children.iter().filter_map(Child::as_node).collect())
    }
}

pub fn min_key<L: TreeLeaf>(node: &NodeRef<L>) -> Vec<u8> {
    node.borrow().min_key()
}

/// Build a fresh leaf-level node from already-loaded leaves (used when
/// deserializing a block back into an in-memory subtree).
pub fn from_leaves<L: TreeLeaf>(leaves: Vec<L>) -> NodeRef<L> {
    let node = new_root();
    node.borrow_mut().children = leaves.into_iter().map(Child::Leaf).collect();
    node
}

/// Build a fresh internal node from already-loaded sub-nodes, wiring their
/// parent pointers back to the new node.
pub fn from_nodes<L: TreeLeaf>(nodes: Vec<NodeRef<L>>) -> NodeRef<L> {
    let node = new_root();
    for n in &nodes {
        n.borrow_mut().parent = Some(Rc::downgrade(&node));
    }
    node.borrow_mut().children = nodes.into_iter().map(Child::Node).collect();
    node
}

use crate::config::TreeLimits;

fn find_root<L: TreeLeaf>(node: &NodeRef<L>) -> NodeRef<L> {
    let mut current = node.clone();
    loop {
        let parent = current.borrow().parent.clone().and_then(|w| w.upgrade());
        match parent {
            Some(p) => current = p,
            None => return current,
        }
    }
}

/// Descend from `root` to the lowest node whose children are leaves,
/// following the child whose key is the greatest one `<=` the search key at
/// each level (i.e. the subtree that would contain `key` if present).
fn descend_to_leaf_node<L: TreeLeaf>(root: &NodeRef<L>, key: &[u8]) -> NodeRef<L> {
    let mut current = root.clone();
    loop {
        let next = {
            let node = current.borrow();
            if node.is_leaf_level() {
                None
            } else {
                let pos = node
                    .children
                    .partition_point(|c| c.key().as_slice() <= key);
                let idx = pos.saturating_sub(1);
                node.children[idx].as_node()
            }
        };
        match next {
            Some(n) => current = n,
            None => return current,
        }
    }
}

/// Exact-match lookup.
pub fn search<L: TreeLeaf>(root: &NodeRef<L>, key: &[u8]) -> Option<L> {
    if is_empty(root) {
        return None;
    }
    let node = descend_to_leaf_node(root, key);
    let node = node.borrow();
    let pos = node.children.partition_point(|c| c.key().as_slice() < key);
    match node.children.get(pos) {
        Some(Child::Leaf(l)) if l.key() == key => Some(l.clone()),
        _ => None,
    }
}

/// The leaf with the greatest key `<= key`, or `None` if every leaf's key is
/// greater than `key` (or the tree is empty). Used for sparse file reads and
/// predecessor-style lookups.
pub fn search_prev_or_eq<L: TreeLeaf>(root: &NodeRef<L>, key: &[u8]) -> Option<L> {
    if is_empty(root) {
        return None;
    }
    let node = descend_to_leaf_node(root, key);
    let node = node.borrow();
    let pos = node
        .children
        .partition_point(|c| c.key().as_slice() <= key);
    if pos == 0 {
        None
    } else {
        match &node.children[pos - 1] {
            Child::Leaf(l) => Some(l.clone()),
            Child::Node(_) => unreachable!("leaf-level node holds only leaves"),
        }
    }
}

/// In-order traversal of every leaf in the tree.
pub fn iter_leaves<L: TreeLeaf>(root: &NodeRef<L>) -> Vec<L> {
    let mut out = Vec::new();
    collect_leaves(root, &mut out);
    out
}

fn collect_leaves<L: TreeLeaf>(node: &NodeRef<L>, out: &mut Vec<L>) {
    let n = node.borrow();
    for child in &n.children {
        match child {
            Child::Leaf(l) => out.push(l.clone()),
            Child::Node(sub) => collect_leaves(sub, out),
        }
    }
}

/// Insert or overwrite the leaf keyed by `leaf.key()`. Returns the (possibly
/// new) tree root.
pub fn insert<L: TreeLeaf>(root: &NodeRef<L>, leaf: L, limits: &TreeLimits) -> NodeRef<L> {
    let key = leaf.key();
    let target = descend_to_leaf_node(root, &key);
    let replaced = {
        let mut node = target.borrow_mut();
        let pos = node.children.partition_point(|c| c.key() < key);
        match node.children.get(pos) {
            Some(existing) if existing.key() == key => {
                node.children[pos] = Child::Leaf(leaf);
                true
            }
            _ => {
                node.children.insert(pos, Child::Leaf(leaf));
                false
            }
        }
    };
    if replaced {
        find_root(&target)
    } else {
        rebalance_after_insert(&target, limits)
    }
}

fn rebalance_after_insert<L: TreeLeaf>(node: &NodeRef<L>, limits: &TreeLimits) -> NodeRef<L> {
    let size = node.borrow().size();
    if size <= limits.maximum_size {
        return find_root(node);
    }

    let parent = node.borrow().parent.clone().and_then(|w| w.upgrade());

    let sibling = {
        let mut n = node.borrow_mut();
        let mid = n.children.len() / 2;
        let right_children = n.children.split_off(mid.max(1));
        Rc::new(std::cell::RefCell::new(TreeNode {
            parent: n.parent.clone(),
            children: right_children,
        }))
    };
    reparent_children(&sibling);

    match parent {
        Some(parent) => {
            insert_child(&parent, sibling);
            rebalance_after_insert(&parent, limits)
        }
        None => {
            let new_root: NodeRef<L> = Rc::new(std::cell::RefCell::new(TreeNode {
                parent: None,
                children: vec![Child::Node(node.clone()), Child::Node(sibling.clone())],
            }));
            set_parent(&Child::Node(node.clone()), &new_root);
            set_parent(&Child::Node(sibling), &new_root);
            new_root
        }
    }
}

fn reparent_children<L: TreeLeaf>(node: &NodeRef<L>) {
    let sub_nodes: Vec<NodeRef<L>> = node.borrow().children.iter().filter_map(Child::as_node).collect();
    for child in sub_nodes {
        child.borrow_mut().parent = Some(Rc::downgrade(node));
    }
}

fn insert_child<L: TreeLeaf>(parent: &NodeRef<L>, child: NodeRef<L>) {
    let key = child.borrow().min_key();
    set_parent(&Child::Node(child.clone()), parent);
    let mut p = parent.borrow_mut();
    let pos = p.children.partition_point(|c| c.key() < key);
    p.children.insert(pos, Child::Node(child));
}

/// Remove the leaf keyed by `key`, if present. Returns the removed leaf and
/// the (possibly new) tree root.
pub fn remove<L: TreeLeaf>(
    root: &NodeRef<L>,
    key: &[u8],
    limits: &TreeLimits,
) -> Option<(L, NodeRef<L>)> {
    if is_empty(root) {
        return None;
    }
    let leaf_node = descend_to_leaf_node(root, key);
    let removed = {
        let mut node = leaf_node.borrow_mut();
        let pos = node.children.partition_point(|c| c.key().as_slice() < key);
        match node.children.get(pos) {
            Some(c) if c.key() == key => match node.children.remove(pos) {
                Child::Leaf(l) => Some(l),
                Child::Node(_) => unreachable!("leaf-level node holds only leaves"),
            },
            _ => None,
        }
    };
    let removed = removed?;
    let new_root = rebalance_after_remove(&leaf_node, limits);
    Some((removed, new_root))
}

fn rebalance_after_remove<L: TreeLeaf>(node: &NodeRef<L>, limits: &TreeLimits) -> NodeRef<L> {
    let parent = node.borrow().parent.clone().and_then(|w| w.upgrade());
    let size = node.borrow().size();
    let is_empty_node = node.borrow().children.is_empty();

    let Some(parent) = parent else {
        if node.borrow().children.len() == 1 {
            let only = node.borrow().children[0].as_node();
            if let Some(only) = only {
                only.borrow_mut().parent = None;
                return only;
            }
        }
        return node.clone();
    };

    if size >= limits.minimum_size && !is_empty_node {
        return find_root(&parent);
    }

    let idx = parent
        .borrow()
        .children
        .iter()
        .position(|c| matches!(c, Child::Node(n) if Rc::ptr_eq(n, node)))
        .expect("node must be a child of its own parent");

    let left = if idx > 0 {
        parent.borrow().children[idx - 1].as_node()
    } else {
        None
    };
    let right = parent.borrow().children.get(idx + 1).and_then(Child::as_node);

    if let Some(left) = &left {
        if is_empty_node || left.borrow().size() > limits.has_spares_size {
            if borrow_from_left(node, left) {
                return find_root(&parent);
            }
        }
    }
    if let Some(right) = &right {
        if is_empty_node || right.borrow().size() > limits.has_spares_size {
            if borrow_from_right(node, right) {
                return find_root(&parent);
            }
        }
    }

    if let Some(left) = left {
        merge_into(&left, node);
        parent.borrow_mut().children.remove(idx);
    } else if let Some(right) = right {
        merge_into(node, &right);
        parent.borrow_mut().children.remove(idx + 1);
    } else {
        return find_root(&parent);
    }
    rebalance_after_remove(&parent, limits)
}

fn borrow_from_left<L: TreeLeaf>(node: &NodeRef<L>, left: &NodeRef<L>) -> bool {
    let moved = {
        let mut l = left.borrow_mut();
        if l.children.len() <= 1 {
            return false;
        }
        l.children.pop()
    };
    match moved {
        Some(child) => {
            set_parent(&child, node);
            node.borrow_mut().children.insert(0, child);
            true
        }
        None => false,
    }
}

fn borrow_from_right<L: TreeLeaf>(node: &NodeRef<L>, right: &NodeRef<L>) -> bool {
    let moved = {
        let mut r = right.borrow_mut();
        if r.children.len() <= 1 {
            return false;
        }
        Some(r.children.remove(0))
    };
    match moved {
        Some(child) => {
            set_parent(&child, node);
            node.borrow_mut().children.push(child);
            true
        }
        None => false,
    }
}

fn merge_into<L: TreeLeaf>(left: &NodeRef<L>, right: &NodeRef<L>) {
    let children = std::mem::take(&mut right.borrow_mut().children);
    for child in &children {
        set_parent(child, left);
    }
    left.borrow_mut().children.extend(children);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Entry {
        key: Vec<u8>,
        size: u64,
    }

    impl TreeLeaf for Entry {
        fn key(&self) -> Vec<u8> {
            self.key.clone()
        }
        fn encoded_size(&self) -> u64 {
            self.size
        }
    }

    fn entry(k: u32, size: u64) -> Entry {
        Entry {
            key: k.to_be_bytes().to_vec(),
            size,
        }
    }

    fn small_limits() -> TreeLimits {
        TreeLimits::from_block_size(200)
    }

    #[test]
    fn insert_and_search_roundtrip() {
        let mut root = new_root();
        let limits = TreeLimits::default();
        for i in 0..50u32 {
            root = insert(&root, entry(i, 16), &limits);
        }
        for i in 0..50u32 {
            let found = search(&root, &i.to_be_bytes()).unwrap();
            assert_eq!(found.key, i.to_be_bytes().to_vec());
        }
        assert!(search(&root, &999u32.to_be_bytes()).is_none());
    }

    #[test]
    fn insert_triggers_split_and_preserves_order() {
        let mut root = new_root();
        let limits = small_limits();
        for i in 0..100u32 {
            root = insert(&root, entry(i, 16), &limits);
        }
        let leaves = iter_leaves(&root);
        assert_eq!(leaves.len(), 100);
        let keys: Vec<u32> = leaves
            .iter()
            .map(|e| u32::from_be_bytes(e.key.clone().try_into().unwrap()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "leaves must stay in key order after splits");
    }

    #[test]
    fn remove_merges_small_nodes_back_down() {
        let mut root = new_root();
        let limits = small_limits();
        for i in 0..100u32 {
            root = insert(&root, entry(i, 16), &limits);
        }
        for i in 0..90u32 {
            let (removed, new_root) = remove(&root, &i.to_be_bytes(), &limits).unwrap();
            assert_eq!(removed.key, i.to_be_bytes().to_vec());
            root = new_root;
        }
        let leaves = iter_leaves(&root);
        assert_eq!(leaves.len(), 10);
        for i in 90..100u32 {
            assert!(search(&root, &i.to_be_bytes()).is_some());
        }
    }

    #[test]
    fn overwrite_existing_key_does_not_duplicate() {
        let mut root = new_root();
        let limits = TreeLimits::default();
        root = insert(&root, entry(1, 16), &limits);
        root = insert(&root, entry(1, 32), &limits);
        assert_eq!(iter_leaves(&root).len(), 1);
        assert_eq!(search(&root, &1u32.to_be_bytes()).unwrap().size, 32);
    }

    #[test]
    fn search_prev_or_eq_finds_predecessor() {
        let mut root = new_root();
        let limits = TreeLimits::default();
        for i in [0u32, 10, 20, 30] {
            root = insert(&root, entry(i, 16), &limits);
        }
        let found = search_prev_or_eq(&root, &15u32.to_be_bytes()).unwrap();
        assert_eq!(found.key, 10u32.to_be_bytes().to_vec());
        let exact = search_prev_or_eq(&root, &20u32.to_be_bytes()).unwrap();
        assert_eq!(exact.key, 20u32.to_be_bytes().to_vec());
        assert!(search_prev_or_eq(&root, &(-1i64 as u32).to_be_bytes()).is_some());
    }

    #[test]
    fn remove_from_empty_tree_is_none() {
        let root: NodeRef<Entry> = new_root();
        let limits = TreeLimits::default();
        assert!(remove(&root, b"x", &limits).is_none());
    }

    #[test]
    fn thousand_name_shuffle_exercises_every_rebalancing_path() {
        use rand::seq::SliceRandom;

        let mut order: Vec<u32> = (0..1000).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut root = new_root();
        let limits = small_limits();
        for &i in &order {
            root = insert(&root, entry(i, 16), &limits);
        }
        assert_eq!(iter_leaves(&root).len(), 1000);
        for i in 0..1000u32 {
            assert!(search(&root, &i.to_be_bytes()).is_some(), "missing {i}");
        }

        order.shuffle(&mut rand::thread_rng());
        for &i in &order {
            let (removed, new_root) = remove(&root, &i.to_be_bytes(), &limits).unwrap();
            assert_eq!(removed.key, i.to_be_bytes().to_vec());
            root = new_root;
        }
        assert_eq!(iter_leaves(&root).len(), 0);
        assert_eq!(root.borrow().children.len(), 0, "tree must collapse back to an empty root");
    }
}
