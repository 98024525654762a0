//! # helixfs-forest
//!
//! The core of a content-addressed, copy-on-write filesystem: a nested
//! hierarchy of B+ trees ("the forest") whose nodes are immutable,
//! content-addressed blocks, exposing POSIX-shaped directory/file/xattr
//! semantics to a host filesystem driver.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │              Host filesystem façade (out of scope)                │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  forest::Forest                                                    │
//! │    nested per-directory / per-file trees, inode table, 3-way merge │
//! ├────────────────────────────────┬───────────────────────────────── ┤
//! │  btree (generic COW B+ tree)   │  forest::file (inline/single/tree) │
//! ├────────────────────────────────┴────────────────────────────────── ┤
//! │  pickle (CBOR pickler)         │  forest::treeser (node <-> block)  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  store::BlockStore (refcounting, write-back cache, extrefs)       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  codec::CodecPipeline (LZ4 + type byte + optional AES-GCM)        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  store::BlockBackend (MemoryBackend / SqliteBackend)              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A call arrives at [`forest::Forest`], which resolves or creates inodes
//! against nested B+ trees; each tree's serialized nodes are blocks
//! identified by `sha256(block_id_key, type‖payload)` and live in the
//! [`store::BlockStore`]. On [`forest::Forest::flush`], dirty tree nodes are
//! re-serialized bottom-up, their new block ids propagate upward, and the
//! new root id is published under the well-known `content` name.
//!
//! See `DESIGN.md` for the module-by-module grounding ledger and the
//! decisions made on the spec's open questions.

pub mod bloom;
pub mod btree;
pub mod codec;
pub mod config;
pub mod error;
pub mod forest;
pub mod hash;
pub mod inode;
pub mod pickle;
pub mod store;

pub use error::{ForestError, ForestResult};
pub use forest::{Attr, Ctx, FileKind, Forest, Statfs};
pub use inode::{Ino, ROOT_INO};
