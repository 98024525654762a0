//! Typed configuration surface (§2.12 ambient stack): codec selection,
//! cache sizing, and the §6 constants, all overridable for tests.

/// How much data we intern inside directory entries before promoting a
/// file to a standalone block (§4.7).
pub const INTERNED_BLOCK_DATA_SIZE_LIMIT: usize = 128;

/// Maximum serialized size of a block / B+ tree node (§3.1, §6).
pub const BLOCK_SIZE_LIMIT: u64 = 128_000;

pub const NAME_HASH_SIZE: usize = 4;
pub const HASH_SIZE: usize = 32;
pub const NAME_SIZE: usize = 256;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const PBKDF2_SALT_SIZE: usize = 16;
pub const AES_GCM_IV_SIZE: usize = 16;
pub const AES_GCM_TAG_SIZE: usize = 16;

/// Default write-back cache ceiling (in bytes of cached block payload)
/// before LRU eviction kicks in (§4.4).
pub const DEFAULT_MAXIMUM_CACHE_SIZE: u64 = 64 * 1024 * 1024;

/// Limits a B+ tree rebalances against, derived from a configurable block
/// size rather than hardcoded so tests can shrink them to exercise
/// splitting/merging without building gigabyte-sized fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLimits {
    pub maximum_size: u64,
    pub minimum_size: u64,
    pub has_spares_size: u64,
}

impl TreeLimits {
    pub fn from_block_size(maximum_size: u64) -> Self {
        let minimum_size = maximum_size / 4;
        let has_spares_size = maximum_size / 2;
        debug_assert!(minimum_size + has_spares_size < maximum_size);
        Self {
            maximum_size,
            minimum_size,
            has_spares_size,
        }
    }
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self::from_block_size(BLOCK_SIZE_LIMIT)
    }
}

/// Which codecs are active in the block codec pipeline (§4.3).
#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub compression: bool,
    pub encryption: Option<EncryptionConfig>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: true,
            encryption: None,
        }
    }
}

/// Password-derived encryption parameters (§4.3). The password itself is
/// never stored; only the derived 32-byte master key lives in memory.
#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub password: Vec<u8>,
    pub salt: [u8; PBKDF2_SALT_SIZE],
    pub iterations: u32,
}

impl EncryptionConfig {
    pub fn new(password: impl Into<Vec<u8>>, salt: [u8; PBKDF2_SALT_SIZE]) -> Self {
        Self {
            password: password.into(),
            salt,
            iterations: PBKDF2_ITERATIONS,
        }
    }
}

/// Top-level forest configuration.
#[derive(Debug, Clone)]
pub struct ForestConfig {
    pub tree_limits: TreeLimits,
    pub interned_block_data_size_limit: usize,
    pub maximum_cache_size: u64,
    pub codec: CodecConfig,
    /// Whether `read` bumps `st_atime_ns`; ambiguous in the source, so it
    /// defaults to off (§9 open questions).
    pub update_atime_on_read: bool,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            tree_limits: TreeLimits::default(),
            interned_block_data_size_limit: INTERNED_BLOCK_DATA_SIZE_LIMIT,
            maximum_cache_size: DEFAULT_MAXIMUM_CACHE_SIZE,
            codec: CodecConfig::default(),
            update_atime_on_read: false,
        }
    }
}
