//! Master-key derivation (§4.3): PBKDF2-HMAC-SHA256 over a user password
//! and a random salt.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::config::EncryptionConfig;

pub const MASTER_KEY_SIZE: usize = 32;

pub fn derive_master_key(cfg: &EncryptionConfig) -> [u8; MASTER_KEY_SIZE] {
    let mut out = [0u8; MASTER_KEY_SIZE];
    pbkdf2_hmac::<Sha256>(&cfg.password, &cfg.salt, cfg.iterations, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PBKDF2_SALT_SIZE;

    #[test]
    fn derivation_is_deterministic_and_salt_sensitive() {
        let salt_a = [1u8; PBKDF2_SALT_SIZE];
        let salt_b = [2u8; PBKDF2_SALT_SIZE];
        let cfg_a = EncryptionConfig::new(b"hunter2".to_vec(), salt_a);
        let cfg_a2 = EncryptionConfig::new(b"hunter2".to_vec(), salt_a);
        let cfg_b = EncryptionConfig::new(b"hunter2".to_vec(), salt_b);

        let key_a = derive_master_key(&cfg_a);
        let key_a2 = derive_master_key(&cfg_a2);
        let key_b = derive_master_key(&cfg_b);

        assert_eq!(key_a, key_a2);
        assert_ne!(key_a, key_b);
    }
}
