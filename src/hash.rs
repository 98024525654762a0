//! Hashing and small byte-level utilities (§2.9).

use sha2::{Digest, Sha256};

/// `sha256(parts[0] || parts[1] || ...)`. Used both for block ids
/// (`sha256(block_id_key, type_byte, payload)`) and in tests.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

/// Pads `buf` with zero bytes up to `len`, no-op if already that long or longer.
pub fn zero_pad(buf: &mut Vec<u8>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0);
    }
}

/// 32-bit MurmurHash3 (x86), used to randomize directory-entry sort keys so
/// B+ tree splits stay balanced regardless of name distribution (§3.1).
///
/// Not security sensitive: the hash is mixed into a sort key, never used as
/// a trust boundary, so a small hand-rolled implementation (matching the
/// reference `mmh3` usage this was distilled from) is appropriate here.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h1 = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k1 = u32::from_le_bytes(chunk.try_into().unwrap());
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);

        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let mut k1: u32 = 0;
    for (i, &b) in tail.iter().enumerate().rev() {
        k1 ^= (b as u32) << (8 * i);
        if i == 0 {
            k1 = k1.wrapping_mul(C1);
            k1 = k1.rotate_left(15);
            k1 = k1.wrapping_mul(C2);
            h1 ^= k1;
        }
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;
    h1
}

/// The 4-byte name-hash prefix used by directory-entry keys.
pub fn name_hash4(name: &[u8]) -> [u8; 4] {
    murmur3_32(name, 0).to_be_bytes()
}
