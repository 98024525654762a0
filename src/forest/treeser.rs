//! (De)serialization between an in-memory B+ tree and block-store blocks
//! (§4.2, §4.6).
//!
//! A whole subtree is loaded or re-serialized as a unit: the Python
//! original loads individual nodes lazily on first attribute access, which
//! Rust's ownership model makes awkward to reproduce faithfully (it relies
//! on dynamic attribute interception). Instead, binding an inode to a
//! directory or file loads its *entire* tree into memory at once, and flush
//! re-serializes the whole dirty subtree bottom-up in one pass — same
//! externally observable behavior (nodes near the protected set stay
//! resident; everything else is dropped once unreferenced), simpler
//! ownership.

use serde::{Deserialize, Serialize};

use crate::btree::{self, ChildrenView, NodeRef, TreeLeaf};
use crate::error::{ForestError, ForestResult};
use crate::pickle::{self, Pickle};
use crate::store::{BlockId, BlockStore};

/// On-disk body of one tree-node block: either a run of leaves (content
/// pickled inline) or a run of child-node references (key + block id),
/// matching the "leafy" bit in the block's type byte.
#[derive(Serialize, Deserialize)]
pub(crate) enum NodeBody<R> {
    Leaves(Vec<R>),
    Children(Vec<(Vec<u8>, BlockId)>),
}

/// Serialize `root`'s subtree bottom-up, writing one block per tree node
/// and returning the root block's id.
pub fn serialize_tree<L>(root: &NodeRef<L>, store: &mut BlockStore, base_type: u8) -> ForestResult<BlockId>
where
    L: TreeLeaf + Pickle,
{
    match btree::children_view(root) {
        ChildrenView::Leaves(leaves) => {
            let refs: Vec<L::Reference> = leaves.iter().map(Pickle::to_reference).collect();
            let body: NodeBody<L::Reference> = NodeBody::Leaves(refs);
            let bytes = pickle::to_bytes(&body)?;
            store.put(base_type, true, &bytes)
        }
        ChildrenView::Nodes(nodes) => {
            let mut entries = Vec::with_capacity(nodes.len());
            for child in &nodes {
                let key = btree::min_key(child);
                let id = serialize_tree(child, store, base_type)?;
                entries.push((key, id));
            }
            let body: NodeBody<L::Reference> = NodeBody::Children(entries);
            let bytes = pickle::to_bytes(&body)?;
            store.put(base_type, false, &bytes)
        }
    }
}

/// The ids a decoded tree-node block itself references: a leaves block
/// references each entry's out-of-line content (a subdirectory's own tree
/// root, a file's single block or block-tree root — never its inline
/// bytes), an internal node references its children. Registered with the
/// block store as its [`DataRefsResolver`](crate::store::DataRefsResolver)
/// so refcounts on those ids track this block's lifetime automatically
/// (§4.4).
///
/// Only the two tree base types (directory entries, file-block entries)
/// carry nested references; any other block type is a leaf of the
/// reference graph.
pub fn extract_block_refs(decoded: &crate::codec::DecodedBlock) -> Vec<BlockId> {
    use crate::store::block_type;

    if !decoded.leafy {
        // The `Children` arm doesn't depend on `R`, so any concrete leaf
        // type decodes it correctly regardless of which tree this node
        // belongs to.
        let body: Result<NodeBody<super::nodes::DirectoryEntry>, _> = pickle::from_bytes(&decoded.payload);
        return match body {
            Ok(NodeBody::Children(entries)) => entries.into_iter().map(|(_, id)| id).collect(),
            _ => Vec::new(),
        };
    }

    match decoded.base_type {
        block_type::DIRECTORY_TREE_NODE => {
            let body: Result<NodeBody<super::nodes::DirectoryEntry>, _> = pickle::from_bytes(&decoded.payload);
            match body {
                Ok(NodeBody::Leaves(entries)) => entries
                    .iter()
                    .flat_map(super::nodes::DirectoryEntry::referenced_block_ids)
                    .collect(),
                _ => Vec::new(),
            }
        }
        block_type::FILE_BLOCK_TREE_NODE => {
            let body: Result<NodeBody<super::nodes::FileBlockEntry>, _> = pickle::from_bytes(&decoded.payload);
            match body {
                Ok(NodeBody::Leaves(entries)) => entries.iter().map(|e| e.block_id).collect(),
                _ => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

/// Load the subtree rooted at block `id` into memory.
pub fn deserialize_tree<L>(id: BlockId, store: &mut BlockStore, base_type: u8) -> ForestResult<NodeRef<L>>
where
    L: TreeLeaf + Pickle,
{
    let decoded = store.get(&id)?;
    if decoded.base_type != base_type {
        return Err(ForestError::corruption(format!(
            "tree block {id:02x?} has type {}, expected {base_type}",
            decoded.base_type
        )));
    }
    let body: NodeBody<L::Reference> = pickle::from_bytes(&decoded.payload)?;
    match body {
        NodeBody::Leaves(refs) => {
            let leaves: Vec<L> = refs.into_iter().map(L::from_reference).collect();
            Ok(btree::from_leaves(leaves))
        }
        NodeBody::Children(entries) => {
            let mut nodes = Vec::with_capacity(entries.len());
            for (_, child_id) in entries {
                nodes.push(deserialize_tree(child_id, store, base_type)?);
            }
            Ok(btree::from_nodes(nodes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{insert, new_root};
    use crate::config::{ForestConfig, TreeLimits};
    use crate::forest::nodes::{DirectoryEntry, EntryContent};
    use crate::store::{block_type, MemoryBackend};

    #[test]
    fn round_trips_a_small_directory_tree() {
        let config = ForestConfig::default();
        let mut store = BlockStore::new(Box::new(MemoryBackend::new()), &config);
        let limits = TreeLimits::default();

        let mut root = new_root();
        for name in ["alpha", "beta", "gamma"] {
            let entry = DirectoryEntry::new_file(name.as_bytes().to_vec(), 0o100644, 0, 0, 0);
            root = insert(&root, entry, &limits);
        }

        let id = serialize_tree(&root, &mut store, block_type::DIRECTORY_TREE_NODE).unwrap();
        let loaded: NodeRef<DirectoryEntry> =
            deserialize_tree(id, &mut store, block_type::DIRECTORY_TREE_NODE).unwrap();

        let names: Vec<Vec<u8>> = btree::iter_leaves(&loaded).into_iter().map(|e| e.name).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&b"alpha".to_vec()));
        assert!(names.contains(&b"beta".to_vec()));
        assert!(names.contains(&b"gamma".to_vec()));
    }

    #[test]
    fn round_trips_a_split_directory_tree() {
        let config = ForestConfig::default();
        let mut store = BlockStore::new(Box::new(MemoryBackend::new()), &config);
        let limits = TreeLimits::from_block_size(200);

        let mut root = new_root();
        for i in 0..100u32 {
            let entry = DirectoryEntry::new_file(format!("file-{i}").into_bytes(), 0o100644, 0, 0, 0);
            root = insert(&root, entry, &limits);
        }

        let id = serialize_tree(&root, &mut store, block_type::DIRECTORY_TREE_NODE).unwrap();
        let loaded: NodeRef<DirectoryEntry> =
            deserialize_tree(id, &mut store, block_type::DIRECTORY_TREE_NODE).unwrap();
        assert_eq!(btree::iter_leaves(&loaded).len(), 100);
    }

    #[test]
    fn directory_content_pointer_round_trips_through_cbor() {
        let entry = DirectoryEntry::new_dir(b"sub".to_vec(), 0o040755, 1, 1, 42);
        let bytes = pickle::to_bytes(&entry).unwrap();
        let back: DirectoryEntry = pickle::from_bytes(&bytes).unwrap();
        assert_eq!(back.content, EntryContent::Directory(None));
        assert_eq!(back.st_mtime_ns, 42);
    }
}
