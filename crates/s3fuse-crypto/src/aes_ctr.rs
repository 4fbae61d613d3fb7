use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// CTR IV length in bytes.
pub const IV_LEN: usize = 16;

/// AES-256-CTR keystream bound to one (key, IV) pair.
///
/// CTR mode is a stream cipher, so encrypt and decrypt are the same
/// operation, and seeking lets independent transfer chunks process their
/// byte ranges without touching each other.
#[derive(Clone)]
pub struct AesCtr256 {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl AesCtr256 {
    /// Binds a keystream to a key and IV.
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// XORs `data` with the keystream starting at byte `offset`.
    pub fn apply(&self, offset: u64, data: &mut [u8]) {
        let mut cipher = Ctr128BE::<Aes256>::new(&self.key.into(), &self.iv.into());
        cipher.seek(offset);
        cipher.apply_keystream(data);
    }
}

impl std::fmt::Debug for AesCtr256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.debug_struct("AesCtr256").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesCtr256 {
        AesCtr256::new([7u8; KEY_LEN], [3u8; IV_LEN])
    }

    #[test]
    fn test_round_trip() {
        let cipher = cipher();
        let plain = b"the quick brown fox jumps over the lazy dog".to_vec();

        let mut data = plain.clone();
        cipher.apply(0, &mut data);
        assert_ne!(data, plain);

        cipher.apply(0, &mut data);
        assert_eq!(data, plain);
    }

    #[test]
    fn test_seek_matches_contiguous_stream() {
        let cipher = cipher();
        let mut whole = vec![0x5a; 100];
        cipher.apply(0, &mut whole);

        // same bytes produced when the buffer is processed as two ranges
        let mut head = vec![0x5a; 37];
        let mut tail = vec![0x5a; 63];
        cipher.apply(0, &mut head);
        cipher.apply(37, &mut tail);

        head.extend_from_slice(&tail);
        assert_eq!(head, whole);
    }

    #[test]
    fn test_different_iv_different_stream() {
        let a = AesCtr256::new([7u8; KEY_LEN], [3u8; IV_LEN]);
        let b = AesCtr256::new([7u8; KEY_LEN], [4u8; IV_LEN]);

        let mut x = vec![0u8; 32];
        let mut y = vec![0u8; 32];
        a.apply(0, &mut x);
        b.apply(0, &mut y);
        assert_ne!(x, y);
    }
}
