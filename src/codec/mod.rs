//! Block codec pipeline (§4.3): compress-and-type, then optionally seal
//! under AES-GCM. Composed as a chain of values rather than inheritance
//! (§9 design notes), so `CodecPipeline` just holds the optional
//! confidential stage and a compression flag.

pub mod confidential;
pub mod key;
pub mod typed;

use crate::config::CodecConfig;
use crate::error::ForestResult;
use confidential::ConfidentialCodec;

/// Decoded block contents before application-level (de)serialization.
pub struct DecodedBlock {
    pub base_type: u8,
    pub leafy: bool,
    pub payload: Vec<u8>,
}

pub struct CodecPipeline {
    compression: bool,
    confidential: Option<ConfidentialCodec>,
    /// `block_id_key` fed into the block-id hash (§4.2): empty unless
    /// encryption is active, in which case it's the master key, so
    /// identical plaintexts under different keys get different ids.
    block_id_key: Vec<u8>,
}

impl CodecPipeline {
    pub fn new(cfg: &CodecConfig) -> Self {
        match &cfg.encryption {
            Some(enc) => {
                let master_key = key::derive_master_key(enc);
                CodecPipeline {
                    compression: cfg.compression,
                    confidential: Some(ConfidentialCodec::new(&master_key)),
                    block_id_key: master_key.to_vec(),
                }
            }
            None => CodecPipeline {
                compression: cfg.compression,
                confidential: None,
                block_id_key: Vec::new(),
            },
        }
    }

    pub fn block_id_key(&self) -> &[u8] {
        &self.block_id_key
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Encode `(base_type, payload)` into on-disk block bytes, addressed by
    /// `block_id` (used as AEAD AAD when encryption is active).
    pub fn encode(&self, block_id: &[u8], base_type: u8, leafy: bool, payload: &[u8]) -> Vec<u8> {
        let typed = typed::encode_typed(base_type, leafy, self.compression, payload);
        self.encode_from_typed(block_id, &typed)
    }

    /// Seal already-typed bytes (skipping the compress-and-type stage).
    /// Used by the block store, which needs the typed bytes on hand to
    /// compute the block id before sealing the same bytes for storage.
    pub fn encode_from_typed(&self, block_id: &[u8], typed: &[u8]) -> Vec<u8> {
        match &self.confidential {
            Some(c) => c.encode(block_id, typed),
            None => typed.to_vec(),
        }
    }

    pub fn decode(&self, block_id: &[u8], data: &[u8]) -> ForestResult<DecodedBlock> {
        let typed_bytes = match &self.confidential {
            Some(c) => c.decode(block_id, data)?,
            None => data.to_vec(),
        };
        let (base_type, leafy, payload) = typed::decode_typed(&typed_bytes)?;
        Ok(DecodedBlock {
            base_type,
            leafy,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncryptionConfig, PBKDF2_SALT_SIZE};

    #[test]
    fn plaintext_round_trip_has_empty_block_id_key() {
        let cfg = CodecConfig {
            compression: true,
            encryption: None,
        };
        let pipeline = CodecPipeline::new(&cfg);
        assert!(pipeline.block_id_key().is_empty());

        let id = b"id";
        let encoded = pipeline.encode(id, 1, true, b"hello");
        let decoded = pipeline.decode(id, &encoded).unwrap();
        assert_eq!(decoded.base_type, 1);
        assert!(decoded.leafy);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn encrypted_round_trip_uses_master_key_as_block_id_key() {
        let cfg = CodecConfig {
            compression: false,
            encryption: Some(EncryptionConfig::new(
                b"correct horse battery staple".to_vec(),
                [3u8; PBKDF2_SALT_SIZE],
            )),
        };
        let pipeline = CodecPipeline::new(&cfg);
        assert_eq!(pipeline.block_id_key().len(), 32);

        let id = b"some-id";
        let encoded = pipeline.encode(id, 2, false, b"secret payload");
        let decoded = pipeline.decode(id, &encoded).unwrap();
        assert_eq!(decoded.payload, b"secret payload");
    }
}
