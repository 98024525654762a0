//! Content-addressed block store (§4.2, §4.4).
//!
//! Blocks are immutable once written: `id = sha256(block_id_key, type_byte,
//! payload)` over the codec-pipeline output, so identical content always
//! maps to the same id and storing it twice is a no-op. A write-back
//! "delayed" layer sits in front of the backend so repeated writes to a
//! block that's about to be rewritten (common during a burst of directory
//! edits) coalesce into one backend write at flush time.

pub mod backend;
pub mod memory;
#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::codec::{CodecPipeline, DecodedBlock};
use crate::config::ForestConfig;
use crate::error::{ForestError, ForestResult};
use crate::hash;

pub use backend::BlockBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "sqlite-backend")]
pub use sqlite::SqliteBackend;

pub type BlockId = [u8; 32];

/// Base block types (§4.1), orthogonal to the `BIT_LEAFY`/`BIT_COMPRESSED`
/// flags the codec pipeline folds into the same type byte.
pub mod block_type {
    pub const FILE_DATA: u8 = 0;
    pub const DIRECTORY_TREE_NODE: u8 = 1;
    pub const FILE_BLOCK_TREE_NODE: u8 = 2;
    pub const INODE_VALUE: u8 = 3;
    pub const BLOOM_FILTER: u8 = 4;
    pub const SUPERBLOCK: u8 = 5;
}

/// Resolves a decoded block's own payload to the ids of every other block it
/// references (§4.4): a directory-tree leaves block references each entry's
/// content id, a tree's internal node references its children, a file-data
/// block references nothing. Registered once by the forest layer so the
/// store can stay ignorant of the on-disk schemas living above it.
pub type DataRefsResolver = Box<dyn Fn(&DecodedBlock) -> Vec<BlockId>>;

/// An in-memory, not-yet-flushed block: its content, whether it's dirty
/// (content written/changed since last flush), and its current refcount.
struct CachedBlock {
    data: Option<Vec<u8>>,
    dirty: bool,
    refcount: u32,
    refcount_dirty: bool,
}

/// Callback consulted before a refcount-0 block is actually deleted: some
/// live inode may still hold a reference to it outside the tree (§4.4,
/// "extref"). Returning `true` keeps the block alive past flush.
pub type ExtRefCallback = Box<dyn Fn(&BlockId) -> bool>;

/// A staged name change: the new target (`None` clears the name) plus
/// whatever it pointed at before this flush cycle, so `flush` knows which
/// id to release once the new one lands (§3.1 "setting a name atomically
/// refers the new id and releases the old").
struct PendingName {
    current: Option<BlockId>,
    original: Option<BlockId>,
}

pub struct BlockStore {
    backend: Box<dyn BlockBackend>,
    codec: CodecPipeline,
    cache: HashMap<BlockId, CachedBlock>,
    lru: VecDeque<BlockId>,
    maximum_cache_size: u64,
    cached_bytes: u64,
    extrefs: Vec<ExtRefCallback>,
    names: HashMap<Vec<u8>, PendingName>,
    data_refs: Option<DataRefsResolver>,
}

impl BlockStore {
    pub fn new(backend: Box<dyn BlockBackend>, config: &ForestConfig) -> Self {
        Self {
            backend,
            codec: CodecPipeline::new(&config.codec),
            cache: HashMap::new(),
            lru: VecDeque::new(),
            maximum_cache_size: config.maximum_cache_size,
            cached_bytes: 0,
            extrefs: Vec::new(),
            names: HashMap::new(),
            data_refs: None,
        }
    }

    /// Register the callback that lets a freshly stored block's own
    /// references be refcounted automatically (§4.4): every block this
    /// crate writes through [`put`](Self::put) is content-addressed, so a
    /// block referencing some id is baked into its bytes exactly once,
    /// regardless of how many other things later come to reference the
    /// *referencing* block itself. That means the cascade only needs to
    /// fire at two points: the first time a given id is ever stored (cascade
    /// incref into whatever it references) and the moment an id is actually
    /// deleted (cascade decref the same way). Anything in between — more
    /// incref/decref calls against an already-known id — only touches that
    /// one id's own count.
    pub fn set_data_refs_resolver(&mut self, resolver: DataRefsResolver) {
        self.data_refs = Some(resolver);
    }

    /// Atomically point `name` at `id`, referencing the new id and
    /// releasing whatever it pointed at before (§3.1, §4.6 phase c). Not
    /// durable until [`flush`](Self::flush).
    pub fn set_name(&mut self, name: &[u8], id: BlockId) -> ForestResult<()> {
        self.set_name_inner(name, Some(id))
    }

    pub fn clear_name(&mut self, name: &[u8]) -> ForestResult<()> {
        self.set_name_inner(name, None)
    }

    fn set_name_inner(&mut self, name: &[u8], id: Option<BlockId>) -> ForestResult<()> {
        let original = match self.names.get(name) {
            Some(existing) => existing.original,
            None => self.backend.get_name(name)?,
        };
        if let Some(new_id) = id {
            self.incref(&new_id)?;
        }
        if let Some(old_id) = original {
            if original != id {
                self.decref(&old_id)?;
            }
        }
        self.names.insert(
            name.to_vec(),
            PendingName {
                current: id,
                original,
            },
        );
        Ok(())
    }

    /// Resolve `name` to its current target, including any not-yet-flushed
    /// change staged this cycle.
    pub fn get_name(&self, name: &[u8]) -> ForestResult<Option<BlockId>> {
        if let Some(pending) = self.names.get(name) {
            return Ok(pending.current);
        }
        self.backend.get_name(name)
    }

    pub fn register_extref(&mut self, callback: ExtRefCallback) {
        self.extrefs.push(callback);
    }

    /// Encode and stage `payload` for writing, returning its content id.
    /// The block isn't durable until [`flush`](Self::flush) runs.
    ///
    /// The very first time this exact content is ever staged (not already in
    /// cache, and not already sitting in the backend), every id the
    /// registered [`DataRefsResolver`] finds inside `payload` is increfed —
    /// the cascade described on [`set_data_refs_resolver`](Self::set_data_refs_resolver).
    pub fn put(&mut self, base_type: u8, leafy: bool, payload: &[u8]) -> ForestResult<BlockId> {
        let typed = crate::codec::typed::encode_typed(base_type, leafy, self.codec.compression(), payload);
        let id = self.compute_id(&typed);

        if let Some(existing) = self.cache.get(&id) {
            if existing.data.is_some() {
                trace!(id = %hex(&id), "put: identical content already staged");
                self.touch_lru(id);
                return Ok(id);
            }
        }
        let is_new = !self.cache.contains_key(&id) && self.backend.get(&id)?.is_none();

        let sealed = self.codec.encode_from_typed(&id, &typed);
        self.touch_lru(id);
        let entry = self.cache.entry(id).or_insert_with(|| CachedBlock {
            data: None,
            dirty: false,
            refcount: 0,
            refcount_dirty: false,
        });
        entry.data = Some(sealed.clone());
        entry.dirty = true;
        self.cached_bytes += sealed.len() as u64;
        self.evict_if_needed();

        if is_new {
            if let Some(resolver) = self.data_refs.take() {
                let decoded = DecodedBlock {
                    base_type,
                    leafy,
                    payload: payload.to_vec(),
                };
                let refs = resolver(&decoded);
                self.data_refs = Some(resolver);
                for child in &refs {
                    self.incref(child)?;
                }
            }
        }
        Ok(id)
    }

    fn compute_id(&self, typed: &[u8]) -> BlockId {
        hash::sha256(&[self.codec.block_id_key(), typed])
    }

    pub fn get(&mut self, id: &BlockId) -> ForestResult<DecodedBlock> {
        if let Some(cached) = self.cache.get(id) {
            if let Some(data) = &cached.data {
                self.touch_lru(*id);
                return self.codec.decode(id, data);
            }
        }
        let raw = self
            .backend
            .get(id)?
            .ok_or(ForestError::NotFound)?;
        let refcount = self.backend.get_refcount(id)?;
        self.cache.insert(
            *id,
            CachedBlock {
                data: Some(raw.clone()),
                dirty: false,
                refcount,
                refcount_dirty: false,
            },
        );
        self.touch_lru(*id);
        self.cached_bytes += raw.len() as u64;
        self.evict_if_needed();
        self.codec.decode(id, &raw)
    }

    pub fn incref(&mut self, id: &BlockId) -> ForestResult<()> {
        self.adjust_refcount(id, 1)
    }

    pub fn decref(&mut self, id: &BlockId) -> ForestResult<()> {
        self.adjust_refcount(id, -1)
    }

    fn adjust_refcount(&mut self, id: &BlockId, delta: i64) -> ForestResult<()> {
        if !self.cache.contains_key(id) {
            let existing_refcount = self.backend.get_refcount(id).unwrap_or(0);
            let data = self.backend.get(id)?;
            self.cache.insert(
                *id,
                CachedBlock {
                    data,
                    dirty: false,
                    refcount: existing_refcount,
                    refcount_dirty: false,
                },
            );
            self.touch_lru(*id);
        }
        let entry = self.cache.get_mut(id).expect("just inserted or present");
        let new_count = (entry.refcount as i64 + delta).max(0) as u32;
        entry.refcount = new_count;
        entry.refcount_dirty = true;
        Ok(())
    }

    fn touch_lru(&mut self, id: BlockId) {
        self.lru.retain(|x| x != &id);
        self.lru.push_back(id);
    }

    fn evict_if_needed(&mut self) {
        let target = self.maximum_cache_size * 3 / 4;
        while self.cached_bytes > target {
            let Some(id) = self.lru.pop_front() else {
                break;
            };
            // Never evict a dirty block: it hasn't reached the backend yet.
            match self.cache.get(&id) {
                Some(c) if !c.dirty && !c.refcount_dirty => {
                    if let Some(c) = self.cache.remove(&id) {
                        if let Some(data) = c.data {
                            self.cached_bytes = self.cached_bytes.saturating_sub(data.len() as u64);
                        }
                    }
                }
                Some(_) => self.lru.push_back(id),
                None => {}
            }
        }
    }

    /// Flush all dirty content and refcount changes to the backend.
    ///
    /// Three passes, matching the write-back discipline the cache is built
    /// around: first name changes (§4.4 step 1), then every block with dirty
    /// *content* is written so a concurrent reader never observes a refcount
    /// update pointing at content that isn't there yet, then every block
    /// whose refcount dropped to zero is either deleted (no extref claims
    /// it) or persisted with its new, lower refcount. A deletion cascades:
    /// the block's own data-references are decrefed too, which can drive
    /// further blocks to zero, so this pass runs as a worklist rather than a
    /// single loop over a fixed snapshot.
    pub fn flush(&mut self) -> ForestResult<()> {
        for (name, pending) in self.names.drain() {
            self.backend.set_name(&name, pending.current)?;
        }

        let dirty_ids: Vec<BlockId> = self
            .cache
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in &dirty_ids {
            let data = self.cache[id].data.clone().expect("dirty block must have content");
            self.backend.put(id, &data)?;
            self.cache.get_mut(id).unwrap().dirty = false;
        }

        let mut queue: VecDeque<BlockId> = self
            .cache
            .iter()
            .filter(|(_, c)| c.refcount_dirty)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(cached) = self.cache.get(&id) else {
                continue;
            };
            if !cached.refcount_dirty {
                continue;
            }
            let refcount = cached.refcount;
            if refcount == 0 && !self.extrefs.iter().any(|cb| cb(&id)) {
                debug!(id = %hex(&id), "flush: deleting refcount-0 block");
                let children = match (&cached.data, &self.data_refs) {
                    (Some(data), Some(_)) => {
                        let decoded = self.codec.decode(&id, data)?;
                        self.data_refs.as_ref().unwrap()(&decoded)
                    }
                    _ => Vec::new(),
                };
                self.backend.delete(&id)?;
                self.cache.remove(&id);
                self.lru.retain(|x| x != &id);
                for child in children {
                    self.adjust_refcount(&child, -1)?;
                    queue.push_back(child);
                }
            } else {
                self.backend.set_refcount(&id, refcount)?;
                self.cache.get_mut(&id).unwrap().refcount_dirty = false;
            }
        }
        self.backend.commit()
    }
}

fn hex(id: &BlockId) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForestConfig;

    fn store() -> BlockStore {
        BlockStore::new(Box::new(MemoryBackend::new()), &ForestConfig::default())
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut s = store();
        let id = s.put(block_type::FILE_DATA, false, b"hello world").unwrap();
        let decoded = s.get(&id).unwrap();
        assert_eq!(decoded.payload, b"hello world");
        assert_eq!(decoded.base_type, block_type::FILE_DATA);
    }

    #[test]
    fn identical_content_is_deduplicated() {
        let mut s = store();
        let id_a = s.put(block_type::FILE_DATA, false, b"same bytes").unwrap();
        let id_b = s.put(block_type::FILE_DATA, false, b"same bytes").unwrap();
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn flush_persists_to_backend_and_survives_cache_eviction() {
        let mut s = store();
        let id = s.put(block_type::FILE_DATA, false, b"durable payload").unwrap();
        s.flush().unwrap();
        s.cache.clear();
        s.lru.clear();
        let decoded = s.get(&id).unwrap();
        assert_eq!(decoded.payload, b"durable payload");
    }

    #[test]
    fn refcount_zero_block_is_deleted_on_flush_without_extref() {
        let mut s = store();
        let id = s.put(block_type::FILE_DATA, false, b"ephemeral").unwrap();
        s.incref(&id).unwrap();
        s.flush().unwrap();
        s.decref(&id).unwrap();
        s.flush().unwrap();
        assert!(matches!(s.get(&id), Err(ForestError::NotFound)));
    }

    #[test]
    fn set_name_resolves_before_and_after_flush() {
        let mut s = store();
        let id = s.put(block_type::DIRECTORY_TREE_NODE, true, b"root body").unwrap();
        s.set_name(b"content", id).unwrap();
        assert_eq!(s.get_name(b"content").unwrap(), Some(id));
        s.flush().unwrap();
        assert_eq!(s.get_name(b"content").unwrap(), Some(id));
    }

    #[test]
    fn repointing_a_name_releases_the_old_target() {
        let mut s = store();
        let old = s.put(block_type::DIRECTORY_TREE_NODE, true, b"old root").unwrap();
        s.set_name(b"content", old).unwrap();
        s.flush().unwrap();

        let new = s.put(block_type::DIRECTORY_TREE_NODE, true, b"new root").unwrap();
        s.set_name(b"content", new).unwrap();
        s.flush().unwrap();

        assert_eq!(s.get_name(b"content").unwrap(), Some(new));
        assert!(matches!(s.get(&old), Err(ForestError::NotFound)));
    }

    #[test]
    fn extref_keeps_refcount_zero_block_alive() {
        let mut s = store();
        let id = s.put(block_type::FILE_DATA, false, b"pinned").unwrap();
        s.incref(&id).unwrap();
        s.flush().unwrap();
        let pinned = id;
        s.register_extref(Box::new(move |candidate| *candidate == pinned));
        s.decref(&id).unwrap();
        s.flush().unwrap();
        assert!(s.get(&id).is_ok());
    }
}
