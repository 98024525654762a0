//! File content model (§4.7): a file's bytes live in one of three regimes
//! depending on size, and every write/truncate re-derives which regime
//! applies rather than tracking a mode flag separately from the size that
//! implies it.
//!
//! - **Inline**: `st_size <= interned_block_data_size_limit` (128 bytes):
//!   bytes sit directly on the directory entry, no block at all.
//! - **Single block**: `st_size <= BLOCK_SIZE_LIMIT` (128,000 bytes): one
//!   `FileData` block holds the whole file.
//! - **Tree**: anything larger is chunked into `BLOCK_SIZE_LIMIT`-sized
//!   `FileData` blocks, indexed by a block-index-keyed B+ tree (§3, §4.7).
//!
//! A `Tree`-mode file's own block tree is rebuilt eagerly, in memory, on
//! every write — the same trade-off [`treeser`](super::treeser) makes for
//! directory trees (simpler ownership than tracking per-node dirty bits),
//! except the tree isn't re-serialized to a block id until flush, so a
//! [`write`] or [`set_size`] result carrying `EntryContent::Tree` uses an
//! unused placeholder id; the caller is expected to treat it as a tag, not
//! a real block id, and defer the real one to flush (§4.6).

use crate::btree::{self, NodeRef};
use crate::config::{TreeLimits, BLOCK_SIZE_LIMIT};
use crate::error::{ForestError, ForestResult};
use crate::hash::zero_pad;
use crate::store::{block_type, BlockStore};

use super::nodes::{EntryContent, FileBlockEntry};

/// The result of a content-changing operation: the entry's new `content`
/// (a placeholder id when `Tree`-tagged, see module docs), the file's
/// in-memory block tree if it's now in `Tree` mode, and the resulting size.
pub struct WriteOutcome {
    pub content: EntryContent,
    pub file_tree: Option<NodeRef<FileBlockEntry>>,
    pub new_size: u64,
}

/// Read `len` bytes starting at `offset`, clamped to `size`. Reads past the
/// last written byte of a block (sparse regions, or a short final block)
/// return zeros rather than erroring (§4.7 "implicit zero fill").
pub fn read(
    content: &EntryContent,
    file_tree: Option<&NodeRef<FileBlockEntry>>,
    store: &mut BlockStore,
    size: u64,
    offset: u64,
    len: usize,
) -> ForestResult<Vec<u8>> {
    let end = offset.saturating_add(len as u64).min(size);
    if offset >= end {
        return Ok(Vec::new());
    }
    let want = (end - offset) as usize;

    match content {
        EntryContent::Inline(bytes) => {
            let mut out = bytes.clone();
            zero_pad(&mut out, size as usize);
            Ok(out[offset as usize..offset as usize + want].to_vec())
        }
        EntryContent::SingleBlock(id) => {
            let mut bytes = store.get(id)?.payload;
            zero_pad(&mut bytes, size as usize);
            Ok(bytes[offset as usize..offset as usize + want].to_vec())
        }
        EntryContent::Tree(_) => {
            let tree = file_tree.expect("Tree-content file must have a loaded block tree");
            let mut out = Vec::with_capacity(want);
            let mut pos = offset;
            while pos < end {
                let idx = pos / BLOCK_SIZE_LIMIT;
                let block_start = idx * BLOCK_SIZE_LIMIT;
                let within = (pos - block_start) as usize;
                let take = (end - pos).min(BLOCK_SIZE_LIMIT - within as u64) as usize;

                let mut block = match btree::search(tree, &idx.to_be_bytes()) {
                    Some(entry) => store.get(&entry.block_id)?.payload,
                    None => Vec::new(),
                };
                zero_pad(&mut block, within + take);
                out.extend_from_slice(&block[within..within + take]);
                pos += take as u64;
            }
            Ok(out)
        }
        EntryContent::Directory(_) | EntryContent::Symlink(_) => {
            Err(ForestError::corruption("read() called on non-file content"))
        }
    }
}

/// Patch `data` into the file at `offset`, growing it first if the write
/// extends past `size`. Returns the regime the file should now be stored
/// under, re-derived from the resulting size rather than kept as separate
/// state.
pub fn write(
    content: &EntryContent,
    file_tree: Option<&NodeRef<FileBlockEntry>>,
    store: &mut BlockStore,
    limits: &TreeLimits,
    interned_limit: usize,
    size: u64,
    offset: u64,
    data: &[u8],
) -> ForestResult<WriteOutcome> {
    let new_size = size.max(offset + data.len() as u64);

    if new_size <= BLOCK_SIZE_LIMIT {
        let mut buf = read(content, file_tree, store, size, 0, size as usize)?;
        zero_pad(&mut buf, offset as usize);
        if offset as usize + data.len() > buf.len() {
            buf.resize(offset as usize + data.len(), 0);
        }
        buf[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        zero_pad(&mut buf, new_size as usize);
        buf.truncate(new_size as usize);
        return Ok(inline_or_single_block(buf, store, interned_limit)?);
    }

    let mut tree = match file_tree {
        Some(t) => t.clone(),
        None => promote_to_tree(content, store, limits, size)?,
    };

    let mut pos = offset;
    let end = offset + data.len() as u64;
    while pos < end {
        let idx = pos / BLOCK_SIZE_LIMIT;
        let block_start = idx * BLOCK_SIZE_LIMIT;
        let within = (pos - block_start) as usize;
        let take = (end - pos).min(BLOCK_SIZE_LIMIT - within as u64) as usize;

        let existing_len = size.saturating_sub(block_start).min(BLOCK_SIZE_LIMIT) as usize;
        let mut block = match btree::search(&tree, &idx.to_be_bytes()) {
            Some(entry) => store.get(&entry.block_id)?.payload,
            None => Vec::new(),
        };
        zero_pad(&mut block, within.max(existing_len));
        if within + take > block.len() {
            block.resize(within + take, 0);
        }
        let src_start = (pos - offset) as usize;
        block[within..within + take].copy_from_slice(&data[src_start..src_start + take]);

        let block_id = store.put(block_type::FILE_DATA, false, &block)?;
        tree = btree::insert(&tree, FileBlockEntry { block_index: idx, block_id }, limits);
        pos += take as u64;
    }

    Ok(WriteOutcome {
        content: EntryContent::Tree([0u8; 32]),
        file_tree: Some(tree),
        new_size,
    })
}

/// Grow (sparse zero-fill) or shrink a file to `new_size`, re-deriving its
/// storage regime the same way [`write`] does.
pub fn set_size(
    content: &EntryContent,
    file_tree: Option<&NodeRef<FileBlockEntry>>,
    store: &mut BlockStore,
    limits: &TreeLimits,
    interned_limit: usize,
    size: u64,
    new_size: u64,
) -> ForestResult<WriteOutcome> {
    if new_size == size {
        return Ok(WriteOutcome {
            content: content.clone(),
            file_tree: file_tree.cloned(),
            new_size,
        });
    }

    if new_size <= BLOCK_SIZE_LIMIT {
        let read_len = new_size.min(size) as usize;
        let mut buf = read(content, file_tree, store, size, 0, read_len)?;
        zero_pad(&mut buf, new_size as usize);
        return inline_or_single_block(buf, store, interned_limit);
    }

    if new_size > size {
        // Sparse growth past the single-block ceiling: promote (if needed)
        // without writing any new block data; reads of the newly-extended
        // range fall through to the tree's implicit zero fill.
        let tree = match file_tree {
            Some(t) => t.clone(),
            None => promote_to_tree(content, store, limits, size)?,
        };
        return Ok(WriteOutcome {
            content: EntryContent::Tree([0u8; 32]),
            file_tree: Some(tree),
            new_size,
        });
    }

    // Shrinking but still tree-sized: drop every block beyond the new
    // boundary and truncate whatever block now straddles it.
    let mut tree = file_tree
        .cloned()
        .ok_or_else(|| ForestError::corruption("shrinking a Tree-content file with no loaded tree"))?;
    let last_idx = (new_size.saturating_sub(1)) / BLOCK_SIZE_LIMIT;
    let stale: Vec<u64> = btree::iter_leaves(&tree)
        .into_iter()
        .map(|e| e.block_index)
        .filter(|idx| *idx > last_idx)
        .collect();
    for idx in stale {
        if let Some((_, new_root)) = btree::remove(&tree, &idx.to_be_bytes(), limits) {
            tree = new_root;
        }
    }
    let boundary_len = (new_size - last_idx * BLOCK_SIZE_LIMIT) as usize;
    if let Some(entry) = btree::search(&tree, &last_idx.to_be_bytes()) {
        let mut bytes = store.get(&entry.block_id)?.payload;
        bytes.truncate(boundary_len);
        let block_id = store.put(block_type::FILE_DATA, false, &bytes)?;
        tree = btree::insert(
            &tree,
            FileBlockEntry {
                block_index: last_idx,
                block_id,
            },
            limits,
        );
    }
    Ok(WriteOutcome {
        content: EntryContent::Tree([0u8; 32]),
        file_tree: Some(tree),
        new_size,
    })
}

fn inline_or_single_block(buf: Vec<u8>, store: &mut BlockStore, interned_limit: usize) -> ForestResult<WriteOutcome> {
    let new_size = buf.len() as u64;
    let content = if buf.len() <= interned_limit {
        EntryContent::Inline(buf)
    } else {
        let id = store.put(block_type::FILE_DATA, false, &buf)?;
        EntryContent::SingleBlock(id)
    };
    Ok(WriteOutcome {
        content,
        file_tree: None,
        new_size,
    })
}

fn promote_to_tree(
    content: &EntryContent,
    store: &mut BlockStore,
    limits: &TreeLimits,
    size: u64,
) -> ForestResult<NodeRef<FileBlockEntry>> {
    let mut tree = btree::new_root();
    if size == 0 {
        return Ok(tree);
    }
    let bytes = match content {
        EntryContent::Inline(b) => b.clone(),
        EntryContent::SingleBlock(id) => store.get(id)?.payload,
        _ => Vec::new(),
    };
    let mut pos = 0u64;
    while pos < size {
        let idx = pos / BLOCK_SIZE_LIMIT;
        let take = (size - pos).min(BLOCK_SIZE_LIMIT) as usize;
        let have = bytes.len().saturating_sub(pos as usize).min(take);
        let mut chunk = bytes[pos as usize..pos as usize + have].to_vec();
        zero_pad(&mut chunk, take);
        let id = store.put(block_type::FILE_DATA, false, &chunk)?;
        tree = btree::insert(&tree, FileBlockEntry { block_index: idx, block_id: id }, limits);
        pos += take as u64;
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForestConfig;
    use crate::store::MemoryBackend;

    fn store() -> BlockStore {
        BlockStore::new(Box::new(MemoryBackend::new()), &ForestConfig::default())
    }

    #[test]
    fn write_within_inline_limit_stays_inline() {
        let mut s = store();
        let limits = TreeLimits::default();
        let out = write(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, b"hello").unwrap();
        assert!(matches!(out.content, EntryContent::Inline(ref b) if b == b"hello"));
        assert_eq!(out.new_size, 5);
    }

    #[test]
    fn write_past_inline_limit_promotes_to_single_block() {
        let mut s = store();
        let limits = TreeLimits::default();
        let data = vec![7u8; 200];
        let out = write(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, &data).unwrap();
        assert!(matches!(out.content, EntryContent::SingleBlock(_)));
        assert_eq!(out.new_size, 200);
    }

    #[test]
    fn write_past_block_size_promotes_to_tree_and_reads_back() {
        let mut s = store();
        let limits = TreeLimits::default();
        let data = vec![9u8; (BLOCK_SIZE_LIMIT + 500) as usize];
        let out = write(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, &data).unwrap();
        assert!(matches!(out.content, EntryContent::Tree(_)));
        let tree = out.file_tree.unwrap();
        let back = read(
            &EntryContent::Tree([0u8; 32]),
            Some(&tree),
            &mut s,
            out.new_size,
            0,
            out.new_size as usize,
        )
        .unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn size_boundaries_select_the_right_regime() {
        let mut s = store();
        let limits = TreeLimits::default();

        let at_limit = write(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, &vec![1u8; 128]).unwrap();
        assert!(matches!(at_limit.content, EntryContent::Inline(ref b) if b.len() == 128), "128 bytes must stay inline");

        let one_over = write(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, &vec![1u8; 129]).unwrap();
        assert!(matches!(one_over.content, EntryContent::SingleBlock(_)), "129 bytes must become a single block");

        let at_block_limit = write(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, &vec![1u8; BLOCK_SIZE_LIMIT as usize]).unwrap();
        assert!(matches!(at_block_limit.content, EntryContent::SingleBlock(_)), "exactly BLOCK_SIZE_LIMIT bytes must still be a single block");

        let one_over_block = write(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, &vec![1u8; (BLOCK_SIZE_LIMIT + 1) as usize]).unwrap();
        assert!(matches!(one_over_block.content, EntryContent::Tree(_)), "BLOCK_SIZE_LIMIT + 1 bytes must become a tree");
    }

    #[test]
    fn sparse_growth_reads_back_as_zeros() {
        let mut s = store();
        let limits = TreeLimits::default();
        let out = set_size(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, BLOCK_SIZE_LIMIT * 2).unwrap();
        let tree = out.file_tree.unwrap();
        let back = read(&EntryContent::Tree([0u8; 32]), Some(&tree), &mut s, out.new_size, 10, 20).unwrap();
        assert_eq!(back, vec![0u8; 20]);
    }

    #[test]
    fn shrinking_a_tree_file_drops_trailing_blocks() {
        let mut s = store();
        let limits = TreeLimits::default();
        let data = vec![1u8; (BLOCK_SIZE_LIMIT * 2) as usize];
        let grown = write(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, &data).unwrap();
        let shrunk = set_size(
            &grown.content,
            grown.file_tree.as_ref(),
            &mut s,
            &limits,
            128,
            grown.new_size,
            BLOCK_SIZE_LIMIT + 10,
        )
        .unwrap();
        let tree = shrunk.file_tree.unwrap();
        assert_eq!(btree::iter_leaves(&tree).len(), 2);
        let back = read(&EntryContent::Tree([0u8; 32]), Some(&tree), &mut s, shrunk.new_size, 0, shrunk.new_size as usize).unwrap();
        assert_eq!(back.len(), (BLOCK_SIZE_LIMIT + 10) as usize);
        assert!(back.iter().all(|&b| b == 1));
    }

    #[test]
    fn shrinking_below_block_size_demotes_to_single_block() {
        let mut s = store();
        let limits = TreeLimits::default();
        let data = vec![3u8; (BLOCK_SIZE_LIMIT + 500) as usize];
        let grown = write(&EntryContent::Inline(Vec::new()), None, &mut s, &limits, 128, 0, &data).unwrap();
        let shrunk = set_size(&grown.content, grown.file_tree.as_ref(), &mut s, &limits, 128, grown.new_size, 50).unwrap();
        assert!(matches!(shrunk.content, EntryContent::Inline(ref b) if b.len() == 50));
    }
}
