//! Storage-backend contract the block store writes through to.
//!
//! A backend only ever sees already-encoded block bytes and opaque ids; it
//! has no notion of the codec pipeline, refcounting policy, or caching layer
//! sitting in front of it.

use super::BlockId;
use crate::error::ForestResult;

pub trait BlockBackend {
    fn get(&self, id: &BlockId) -> ForestResult<Option<Vec<u8>>>;
    fn put(&mut self, id: &BlockId, data: &[u8]) -> ForestResult<()>;
    fn delete(&mut self, id: &BlockId) -> ForestResult<()>;

    fn get_refcount(&self, id: &BlockId) -> ForestResult<u32>;
    fn set_refcount(&mut self, id: &BlockId, count: u32) -> ForestResult<()>;

    /// Resolve a short block name (e.g. the well-known `content` root
    /// pointer, §6) to the block id it currently refers to.
    fn get_name(&self, name: &[u8]) -> ForestResult<Option<BlockId>>;
    /// Atomically point `name` at `id`, or clear it if `id` is `None`.
    fn set_name(&mut self, name: &[u8], id: Option<BlockId>) -> ForestResult<()>;

    /// Make the writes issued so far durable. A no-op for backends without
    /// a meaningful commit boundary (e.g. the in-memory one).
    fn commit(&mut self) -> ForestResult<()> {
        Ok(())
    }
}
