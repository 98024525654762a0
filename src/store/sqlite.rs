//! SQLite-backed on-disk block store (`sqlite-backend` feature, §4.4).
//!
//! Writes are buffered in memory and only touch disk inside a single
//! transaction on [`commit`](SqliteBackend::commit), matching the block
//! store's own two-pass flush: either every buffered change for this flush
//! lands, or (on a transaction failure) none of it does.

use std::collections::HashMap;

use rusqlite::{params, Connection};

use super::backend::BlockBackend;
use super::BlockId;
use crate::error::ForestResult;

enum PendingOp {
    Put(Vec<u8>),
    Delete,
    SetRefcount(u32),
}

pub struct SqliteBackend {
    conn: Connection,
    pending: HashMap<BlockId, PendingOp>,
    pending_names: HashMap<Vec<u8>, Option<BlockId>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<std::path::Path>) -> ForestResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn,
            pending: HashMap::new(),
            pending_names: HashMap::new(),
        })
    }

    pub fn open_in_memory() -> ForestResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn,
            pending: HashMap::new(),
            pending_names: HashMap::new(),
        })
    }

    fn init_schema(conn: &Connection) -> ForestResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                id       BLOB PRIMARY KEY,
                data     BLOB NOT NULL,
                refcount INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS names (
                name     BLOB PRIMARY KEY,
                block_id BLOB NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl BlockBackend for SqliteBackend {
    fn get(&self, id: &BlockId) -> ForestResult<Option<Vec<u8>>> {
        if let Some(op) = self.pending.get(id) {
            return Ok(match op {
                PendingOp::Put(data) => Some(data.clone()),
                PendingOp::Delete => None,
                PendingOp::SetRefcount(_) => self.read_committed_data(id)?,
            });
        }
        self.read_committed_data(id)
    }

    fn put(&mut self, id: &BlockId, data: &[u8]) -> ForestResult<()> {
        self.pending.insert(*id, PendingOp::Put(data.to_vec()));
        Ok(())
    }

    fn delete(&mut self, id: &BlockId) -> ForestResult<()> {
        self.pending.insert(*id, PendingOp::Delete);
        Ok(())
    }

    fn get_refcount(&self, id: &BlockId) -> ForestResult<u32> {
        if let Some(PendingOp::SetRefcount(n)) = self.pending.get(id) {
            return Ok(*n);
        }
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT refcount FROM blocks WHERE id = ?1",
                params![id.as_slice()],
                |row| row.get(0),
            )
            .ok();
        Ok(count.unwrap_or(0) as u32)
    }

    fn set_refcount(&mut self, id: &BlockId, count: u32) -> ForestResult<()> {
        self.pending.insert(*id, PendingOp::SetRefcount(count));
        Ok(())
    }

    fn get_name(&self, name: &[u8]) -> ForestResult<Option<BlockId>> {
        if let Some(pending) = self.pending_names.get(name) {
            return Ok(*pending);
        }
        let row: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT block_id FROM names WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .ok();
        Ok(row.map(|bytes| {
            let mut id = [0u8; 32];
            id.copy_from_slice(&bytes);
            id
        }))
    }

    fn set_name(&mut self, name: &[u8], id: Option<BlockId>) -> ForestResult<()> {
        self.pending_names.insert(name.to_vec(), id);
        Ok(())
    }

    fn commit(&mut self) -> ForestResult<()> {
        if self.pending.is_empty() && self.pending_names.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        for (name, id) in self.pending_names.drain() {
            match id {
                Some(id) => {
                    tx.execute(
                        "INSERT INTO names (name, block_id) VALUES (?1, ?2)
                         ON CONFLICT(name) DO UPDATE SET block_id = excluded.block_id",
                        params![name, id.as_slice()],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM names WHERE name = ?1", params![name])?;
                }
            }
        }
        for (id, op) in self.pending.drain() {
            match op {
                PendingOp::Put(data) => {
                    tx.execute(
                        "INSERT INTO blocks (id, data, refcount) VALUES (?1, ?2, 0)
                         ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                        params![id.as_slice(), data],
                    )?;
                }
                PendingOp::Delete => {
                    tx.execute("DELETE FROM blocks WHERE id = ?1", params![id.as_slice()])?;
                }
                PendingOp::SetRefcount(count) => {
                    tx.execute(
                        "UPDATE blocks SET refcount = ?2 WHERE id = ?1",
                        params![id.as_slice(), count],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl SqliteBackend {
    fn read_committed_data(&self, id: &BlockId) -> ForestResult<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM blocks WHERE id = ?1",
                params![id.as_slice()],
                |row| row.get(0),
            )
            .ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_invisible_to_backend_until_commit() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        let id = [4u8; 32];
        backend.put(&id, b"staged").unwrap();
        assert_eq!(backend.get(&id).unwrap(), Some(b"staged".to_vec()));
        backend.commit().unwrap();
        assert_eq!(backend.get(&id).unwrap(), Some(b"staged".to_vec()));
    }

    #[test]
    fn delete_after_commit_round_trips() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        let id = [5u8; 32];
        backend.put(&id, b"data").unwrap();
        backend.commit().unwrap();
        backend.delete(&id).unwrap();
        backend.commit().unwrap();
        assert_eq!(backend.get(&id).unwrap(), None);
    }

    #[test]
    fn refcount_round_trips_through_commit() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        let id = [6u8; 32];
        backend.put(&id, b"x").unwrap();
        backend.set_refcount(&id, 3).unwrap();
        backend.commit().unwrap();
        assert_eq!(backend.get_refcount(&id).unwrap(), 3);
    }

    #[test]
    fn name_survives_commit_and_can_be_cleared() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        let id = [7u8; 32];
        backend.set_name(b"content", Some(id)).unwrap();
        backend.commit().unwrap();
        assert_eq!(backend.get_name(b"content").unwrap(), Some(id));
        backend.set_name(b"content", None).unwrap();
        backend.commit().unwrap();
        assert_eq!(backend.get_name(b"content").unwrap(), None);
    }
}
