//! In-memory dict-backed store (§4.4), the canonical backend for tests and
//! for callers who don't need durability across process restarts.

use std::collections::HashMap;

use super::backend::BlockBackend;
use super::BlockId;
use crate::error::{ForestError, ForestResult};

#[derive(Default)]
pub struct MemoryBackend {
    blocks: HashMap<BlockId, Vec<u8>>,
    refcounts: HashMap<BlockId, u32>,
    names: HashMap<Vec<u8>, BlockId>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockBackend for MemoryBackend {
    fn get(&self, id: &BlockId) -> ForestResult<Option<Vec<u8>>> {
        Ok(self.blocks.get(id).cloned())
    }

    fn put(&mut self, id: &BlockId, data: &[u8]) -> ForestResult<()> {
        self.blocks.insert(*id, data.to_vec());
        Ok(())
    }

    fn delete(&mut self, id: &BlockId) -> ForestResult<()> {
        self.blocks.remove(id).ok_or(ForestError::NotFound)?;
        self.refcounts.remove(id);
        Ok(())
    }

    fn get_refcount(&self, id: &BlockId) -> ForestResult<u32> {
        Ok(self.refcounts.get(id).copied().unwrap_or(0))
    }

    fn set_refcount(&mut self, id: &BlockId, count: u32) -> ForestResult<()> {
        self.refcounts.insert(*id, count);
        Ok(())
    }

    fn get_name(&self, name: &[u8]) -> ForestResult<Option<BlockId>> {
        Ok(self.names.get(name).copied())
    }

    fn set_name(&mut self, name: &[u8], id: Option<BlockId>) -> ForestResult<()> {
        match id {
            Some(id) => {
                self.names.insert(name.to_vec(), id);
            }
            None => {
                self.names.remove(name);
            }
        }
        Ok(())
    }
}
