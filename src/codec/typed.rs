//! The "Compressing Typed" + "Typed" stages of the codec pipeline (§4.3,
//! items 1-2): an optional LZ4 pass, folded into the block's type byte,
//! followed by prefixing that type byte onto the payload.

use crate::error::ForestResult;

pub const BIT_LEAFY: u8 = 0x40;
pub const BIT_COMPRESSED: u8 = 0x80;
pub const TYPE_MASK: u8 = 0x0F;

/// Compress `payload` with LZ4 and report whether the compressed form won.
/// Mirrors §4.3.1: only use the compressed bytes if they are *strictly*
/// smaller, so tiny or incompressible blocks don't pay a framing tax.
pub fn maybe_compress(payload: &[u8]) -> (bool, Vec<u8>) {
    let compressed = lz4_flex::compress_prepend_size(payload);
    if compressed.len() < payload.len() {
        (true, compressed)
    } else {
        (false, payload.to_vec())
    }
}

pub fn decompress(payload: &[u8]) -> ForestResult<Vec<u8>> {
    lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| crate::error::ForestError::corruption(format!("lz4 decode: {e}")))
}

/// Encode `(type, payload)` into `[type_byte][maybe-compressed payload]`,
/// setting `BIT_COMPRESSED`/`BIT_LEAFY` in the type byte as requested.
pub fn encode_typed(base_type: u8, leafy: bool, compress: bool, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(base_type & !TYPE_MASK, 0, "base type must fit in the low nibble");
    let mut type_byte = base_type;
    if leafy {
        type_byte |= BIT_LEAFY;
    }
    let (was_compressed, body) = if compress {
        maybe_compress(payload)
    } else {
        (false, payload.to_vec())
    };
    if was_compressed {
        type_byte |= BIT_COMPRESSED;
    }
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(type_byte);
    out.extend_from_slice(&body);
    out
}

/// Inverse of [`encode_typed`]: strips the type byte, decompressing the
/// remainder iff `BIT_COMPRESSED` was set. Returns `(base_type, leafy, payload)`.
pub fn decode_typed(data: &[u8]) -> ForestResult<(u8, bool, Vec<u8>)> {
    let (&type_byte, rest) = data
        .split_first()
        .ok_or_else(|| crate::error::ForestError::corruption("empty block body"))?;
    let leafy = type_byte & BIT_LEAFY != 0;
    let compressed = type_byte & BIT_COMPRESSED != 0;
    let base_type = type_byte & TYPE_MASK;
    let payload = if compressed {
        decompress(rest)?
    } else {
        rest.to_vec()
    };
    Ok((base_type, leafy, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_uncompressed() {
        let payload = b"short";
        let encoded = encode_typed(1, true, true, payload);
        let (t, leafy, out) = decode_typed(&encoded).unwrap();
        assert_eq!(t, 1);
        assert!(leafy);
        assert_eq!(out, payload);
    }

    #[test]
    fn round_trips_compressed_payload() {
        let payload = vec![b'a'; 4096];
        let encoded = encode_typed(2, false, true, &payload);
        assert_eq!(encoded[0] & BIT_COMPRESSED, BIT_COMPRESSED);
        let (t, leafy, out) = decode_typed(&encoded).unwrap();
        assert_eq!(t, 2);
        assert!(!leafy);
        assert_eq!(out, payload);
    }

    #[test]
    fn incompressible_payload_keeps_raw_bytes() {
        // Already-random bytes shouldn't shrink under LZ4; the codec must
        // fall back to storing them uncompressed rather than inflating.
        let payload: Vec<u8> = (0..64u32).map(|x| (x.wrapping_mul(2654435761) >> 24) as u8).collect();
        let encoded = encode_typed(1, false, true, &payload);
        let (_, _, out) = decode_typed(&encoded).unwrap();
        assert_eq!(out, payload);
    }
}
