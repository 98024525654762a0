//! Leaf types that live in the forest's two kinds of B+ tree: directory
//! entries (§3.1, §6 "persistent directory-entry fields") and file-block
//! entries (§4.7).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::btree::TreeLeaf;
use crate::config::{HASH_SIZE, NAME_HASH_SIZE};
use crate::hash::name_hash4;
use crate::pickle::Pickle;
use crate::store::BlockId;

/// Where a directory entry's content currently lives (§4.7).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryContent {
    /// A directory: `block_id` of its own directory-tree root, or `None`
    /// for a not-yet-populated (empty) directory.
    Directory(Option<BlockId>),
    /// A file whose bytes fit inline on the entry itself.
    Inline(Vec<u8>),
    /// A file backed by exactly one `FileData` block (`minifile`).
    SingleBlock(BlockId),
    /// A file backed by a block tree keyed by big-endian block index.
    Tree(BlockId),
    /// A symlink target.
    Symlink(Vec<u8>),
}

impl EntryContent {
    pub fn inline_len(&self) -> usize {
        match self {
            EntryContent::Inline(data) => data.len(),
            _ => 0,
        }
    }

    /// The block id(s) this content variant points at out-of-line, if any.
    /// Used to refcount a directory-tree leaves block's own references
    /// (§4.4); inline bytes and symlink targets live directly on the entry
    /// and reference nothing.
    pub fn referenced_block_ids(&self) -> Vec<BlockId> {
        match self {
            EntryContent::Directory(Some(id)) | EntryContent::SingleBlock(id) | EntryContent::Tree(id) => {
                vec![*id]
            }
            _ => Vec::new(),
        }
    }
}

/// `hash4(name) ++ name` (§3.1), the sort key a directory entry occupies in
/// its parent's tree. Exposed standalone so callers can build a search key
/// without having an entry to hand.
pub fn entry_key(name: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(NAME_HASH_SIZE + name.len());
    k.extend_from_slice(&name_hash4(name));
    k.extend_from_slice(name);
    k
}

/// A directory entry: one name inside a parent directory's tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    #[serde(rename = "1")]
    pub name: Vec<u8>,
    #[serde(rename = "2")]
    pub st_mode: u32,
    #[serde(rename = "3")]
    pub st_uid: u32,
    #[serde(rename = "4")]
    pub st_gid: u32,
    #[serde(rename = "5")]
    pub st_rdev: u32,
    #[serde(rename = "6")]
    pub st_size: u64,
    #[serde(rename = "7")]
    pub st_atime_ns: i64,
    #[serde(rename = "8")]
    pub st_mtime_ns: i64,
    #[serde(rename = "9")]
    pub st_ctime_ns: i64,
    #[serde(rename = "10", default)]
    pub xattr: BTreeMap<String, Vec<u8>>,
    #[serde(rename = "11")]
    pub content: EntryContent,
}

impl DirectoryEntry {
    pub fn new_file(name: Vec<u8>, mode: u32, uid: u32, gid: u32, now_ns: i64) -> Self {
        Self {
            name,
            st_mode: mode,
            st_uid: uid,
            st_gid: gid,
            st_rdev: 0,
            st_size: 0,
            st_atime_ns: now_ns,
            st_mtime_ns: now_ns,
            st_ctime_ns: now_ns,
            xattr: BTreeMap::new(),
            content: EntryContent::Inline(Vec::new()),
        }
    }

    pub fn new_dir(name: Vec<u8>, mode: u32, uid: u32, gid: u32, now_ns: i64) -> Self {
        Self {
            name,
            st_mode: mode | 0o040000,
            st_uid: uid,
            st_gid: gid,
            st_rdev: 0,
            st_size: 0,
            st_atime_ns: now_ns,
            st_mtime_ns: now_ns,
            st_ctime_ns: now_ns,
            xattr: BTreeMap::new(),
            content: EntryContent::Directory(None),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.content, EntryContent::Directory(_))
    }
}

impl TreeLeaf for DirectoryEntry {
    /// `hash4(name) ++ name` (§3.1): the hash prefix randomizes split
    /// distribution regardless of how names cluster lexicographically.
    fn key(&self) -> Vec<u8> {
        entry_key(&self.name)
    }

    /// `HEADER + len(name)` per §4.1, extended with any inlined file bytes
    /// (the baseline formula assumes out-of-line content, which doesn't
    /// hold for small inline files and would otherwise let a directory full
    /// of maximally-inlined files dodge its byte-size split threshold).
    fn encoded_size(&self) -> u64 {
        (NAME_HASH_SIZE + HASH_SIZE) as u64 + self.name.len() as u64 + self.content.inline_len() as u64
    }
}

impl Pickle for DirectoryEntry {
    type Reference = DirectoryEntry;

    fn to_reference(&self) -> Self::Reference {
        self.clone()
    }

    fn from_reference(r: Self::Reference) -> Self {
        r
    }
}

/// One leaf of a file's block tree (§4.7): maps a block index to the
/// `FileData` block covering that range of the file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileBlockEntry {
    #[serde(rename = "1")]
    pub block_index: u64,
    #[serde(rename = "2")]
    pub block_id: BlockId,
}

impl TreeLeaf for FileBlockEntry {
    /// Raw big-endian block index, *not* hashed — file blocks must stay
    /// numerically ordered so range scans over contiguous regions are
    /// contiguous in the tree too.
    fn key(&self) -> Vec<u8> {
        self.block_index.to_be_bytes().to_vec()
    }

    fn encoded_size(&self) -> u64 {
        8 + HASH_SIZE as u64
    }
}

impl Pickle for FileBlockEntry {
    type Reference = FileBlockEntry;

    fn to_reference(&self) -> Self::Reference {
        self.clone()
    }

    fn from_reference(r: Self::Reference) -> Self {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_entry_key_is_hash_prefixed_name() {
        let e = DirectoryEntry::new_file(b"hello.txt".to_vec(), 0o100644, 0, 0, 0);
        let key = e.key();
        assert_eq!(key.len(), NAME_HASH_SIZE + b"hello.txt".len());
        assert_eq!(&key[NAME_HASH_SIZE..], b"hello.txt");
    }

    #[test]
    fn file_block_entry_key_is_unhashed_big_endian_index() {
        let e = FileBlockEntry {
            block_index: 7,
            block_id: [0u8; 32],
        };
        assert_eq!(e.key(), 7u64.to_be_bytes().to_vec());
    }

    #[test]
    fn file_block_entry_keys_sort_numerically() {
        let a = FileBlockEntry { block_index: 2, block_id: [0; 32] }.key();
        let b = FileBlockEntry { block_index: 16, block_id: [0; 32] }.key();
        assert!(a < b, "block index 2 must sort before 16 under byte-wise comparison");
    }
}
