use std::num::NonZeroU32;

use rand::RngCore;
use zeroize::Zeroize;

use s3fuse_base::error::{Error, Result};

use crate::aes_ctr::{AesCtr256, IV_LEN, KEY_LEN};

/// PBKDF2 rounds for password-derived volume keys.
const PBKDF2_ITERATIONS: u32 = 8192;

/// The volume key: process-wide, immutable after init, wraps every
/// per-object data key.
pub struct VolumeKey {
    key: [u8; KEY_LEN],
}

impl VolumeKey {
    /// Derives the volume key from a password with PBKDF2-HMAC-SHA256.
    ///
    /// The salt is stable per volume (the bucket name), so the same password
    /// always yields the same key for a given bucket.
    pub fn derive(password: &str, salt: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        ring::pbkdf2::derive(
            ring::pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
            salt,
            password.as_bytes(),
            &mut key,
        );
        Self { key }
    }

    /// Generates a fresh data key and IV for one object.
    pub fn generate_data_key() -> ([u8; KEY_LEN], [u8; IV_LEN]) {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);
        (key, iv)
    }

    /// Wraps a data key under the volume key, bound to the object's IV.
    pub fn wrap(&self, data_key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Vec<u8> {
        let mut wrapped = data_key.to_vec();
        AesCtr256::new(self.key, *iv).apply(0, &mut wrapped);
        wrapped
    }

    /// Unwraps a data key. Fails when the stored blob has the wrong length.
    pub fn unwrap(&self, wrapped: &[u8], iv: &[u8; IV_LEN]) -> Result<[u8; KEY_LEN]> {
        if wrapped.len() != KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "wrapped key must be {KEY_LEN} bytes, found {}",
                wrapped.len()
            )));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(wrapped);
        AesCtr256::new(self.key, *iv).apply(0, &mut key);
        Ok(key)
    }
}

impl Drop for VolumeKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeKey").finish_non_exhaustive()
    }
}
