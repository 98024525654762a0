//! The optional "Confidential" stage (§4.3.3): AES-256-GCM over the whole
//! `[type_byte][payload]` blob, with the block id as additional
//! authenticated data so ciphertexts can't be replayed under a different id.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::config::{AES_GCM_IV_SIZE, AES_GCM_TAG_SIZE};
use crate::error::{ForestError, ForestResult};

/// 4-byte magic prefixing every encrypted block, so a misconfigured reader
/// (wrong key, or plaintext-vs-encrypted mismatch) fails fast instead of
/// trying to interpret ciphertext as a type byte.
pub const MAGIC: [u8; 4] = *b"HFE1";

pub struct ConfidentialCodec {
    cipher: Aes256Gcm,
}

impl ConfidentialCodec {
    pub fn new(master_key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(master_key.into()),
        }
    }

    /// Seal `plaintext` (the `[type_byte][payload]` blob) under `block_id`
    /// as AAD, framed as `magic(4) || iv(16) || tag(16) || ciphertext`.
    ///
    /// AES-GCM proper takes a 12-byte nonce; the on-disk framing reserves
    /// 16 bytes for it, zero-padded, to match the §4.3/§6 wire format.
    pub fn encode(&self, block_id: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; AES_GCM_IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv[..12]);
        let sealed = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: block_id,
                },
            )
            .expect("AES-GCM encryption is infallible for well-formed inputs");
        let (ciphertext, tag) = sealed.split_at(sealed.len() - AES_GCM_TAG_SIZE);

        let mut out = Vec::with_capacity(MAGIC.len() + iv.len() + tag.len() + ciphertext.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        out
    }

    pub fn decode(&self, block_id: &[u8], framed: &[u8]) -> ForestResult<Vec<u8>> {
        let header = MAGIC.len() + AES_GCM_IV_SIZE + AES_GCM_TAG_SIZE;
        if framed.len() < header {
            return Err(ForestError::corruption("encrypted block too short"));
        }
        let (magic, rest) = framed.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(ForestError::corruption("bad confidential-codec magic"));
        }
        let (iv, rest) = rest.split_at(AES_GCM_IV_SIZE);
        let (tag, ciphertext) = rest.split_at(AES_GCM_TAG_SIZE);

        let nonce = Nonce::from_slice(&iv[..12]);
        let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed,
                    aad: block_id,
                },
            )
            .map_err(|_| ForestError::corruption("AEAD authentication failed"))
    }
}
