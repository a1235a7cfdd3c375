//! AES-256-CTR keystream cipher
//!
//! The counter block is a 128-bit big-endian integer: the last byte is the
//! least significant and carries propagate toward the first byte. Every
//! connection owns one instance per direction for its whole lifetime, and
//! encryption and decryption are the same XOR operation.

use std::fmt;

use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// AES-256 key length
pub const KEY_LEN: usize = 32;
/// Counter block (IV) length
pub const IV_LEN: usize = 16;

/// Stateful AES-CTR byte-stream cipher
pub struct KeystreamCipher {
    inner: Aes256Ctr,
}

impl KeystreamCipher {
    /// Create a cipher positioned at the start of the keystream
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        Self {
            inner: Aes256Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
        }
    }

    /// XOR `buf` in place with the next `buf.len()` keystream bytes
    #[inline]
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }

    /// Discard `n` keystream bytes, exactly as if `n` bytes had been processed
    pub fn skip(&mut self, n: usize) {
        let pos: u64 = self.inner.current_pos();
        self.inner.seek(pos + n as u64);
    }

    /// Number of keystream bytes consumed so far
    pub fn position(&self) -> u64 {
        self.inner.current_pos()
    }
}

impl fmt::Debug for KeystreamCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs
        f.debug_struct("KeystreamCipher")
            .field("position", &self.position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::{BlockEncrypt, KeyInit};

    fn test_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7).wrapping_add(3);
        }
        key
    }

    fn test_iv() -> [u8; IV_LEN] {
        let mut iv = [0u8; IV_LEN];
        for (i, b) in iv.iter_mut().enumerate() {
            *b = 0xA0 ^ i as u8;
        }
        iv
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_various_lengths() {
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 100, 1000, 4097] {
            let plain = sample(len);
            let mut data = plain.clone();

            KeystreamCipher::new(&test_key(), &test_iv()).apply(&mut data);
            if len > 0 {
                assert_ne!(data, plain, "ciphertext should differ for len {}", len);
            }
            KeystreamCipher::new(&test_key(), &test_iv()).apply(&mut data);
            assert_eq!(data, plain, "round trip failed for len {}", len);
        }
    }

    #[test]
    fn test_incremental_apply_matches_single_call() {
        let plain = sample(300);

        let mut whole = plain.clone();
        KeystreamCipher::new(&test_key(), &test_iv()).apply(&mut whole);

        let mut pieces = plain.clone();
        let mut cipher = KeystreamCipher::new(&test_key(), &test_iv());
        let mut offset = 0;
        for size in [1usize, 3, 12, 16, 5, 40, 7, 100] {
            cipher.apply(&mut pieces[offset..offset + size]);
            offset += size;
        }
        cipher.apply(&mut pieces[offset..]);

        assert_eq!(whole, pieces);
        assert_eq!(cipher.position(), 300);
    }

    #[test]
    fn test_skip_equivalence() {
        for skip in [0usize, 1, 8, 15, 16, 56, 57, 200] {
            let payload = sample(77);

            let mut skipped = payload.clone();
            let mut cipher = KeystreamCipher::new(&test_key(), &test_iv());
            cipher.skip(skip);
            cipher.apply(&mut skipped);

            let mut prefixed = vec![0u8; skip];
            prefixed.extend_from_slice(&payload);
            KeystreamCipher::new(&test_key(), &test_iv()).apply(&mut prefixed);

            assert_eq!(&prefixed[skip..], &skipped[..], "skip {} diverged", skip);
        }
    }

    #[test]
    fn test_skip_after_partial_block() {
        let mut a = vec![0u8; 40];
        let mut cipher = KeystreamCipher::new(&test_key(), &test_iv());
        cipher.apply(&mut a[..5]);
        cipher.skip(20);
        cipher.apply(&mut a[25..]);

        let mut b = vec![0u8; 40];
        KeystreamCipher::new(&test_key(), &test_iv()).apply(&mut b);

        assert_eq!(&a[..5], &b[..5]);
        assert_eq!(&a[25..], &b[25..]);
    }

    #[test]
    fn test_counter_carries_into_upper_bytes() {
        let key = test_key();
        let mut iv = [0u8; IV_LEN];
        iv[13] = 0x01;
        iv[14] = 0xFF;
        iv[15] = 0xFF;

        let mut gamma = [0u8; 32];
        KeystreamCipher::new(&key, &iv).apply(&mut gamma);

        let aes = aes::Aes256::new(GenericArray::from_slice(&key));
        let mut first = GenericArray::clone_from_slice(&iv);
        aes.encrypt_block(&mut first);

        let mut next_counter = [0u8; IV_LEN];
        next_counter[13] = 0x02;
        let mut second = GenericArray::clone_from_slice(&next_counter);
        aes.encrypt_block(&mut second);

        assert_eq!(&gamma[..16], first.as_slice());
        assert_eq!(&gamma[16..], second.as_slice());
    }

    #[test]
    fn test_nist_ctr_aes256_vector() {
        // NIST SP 800-38A, F.5.5 CTR-AES256.Encrypt
        let key: [u8; KEY_LEN] = hex::decode(
            "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4",
        )
        .unwrap()
        .try_into()
        .unwrap();
        let iv: [u8; IV_LEN] = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff")
            .unwrap()
            .try_into()
            .unwrap();

        let mut data =
            hex::decode("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51")
                .unwrap();
        let mut cipher = KeystreamCipher::new(&key, &iv);
        cipher.apply(&mut data[..7]);
        cipher.apply(&mut data[7..]);

        assert_eq!(
            hex::encode(&data),
            "601ec313775789a5b7a7f504bbf3d228f443e3ca4d62b59aca84e990cacaf5c5"
        );
    }

    #[test]
    fn test_debug_hides_key() {
        let mut cipher = KeystreamCipher::new(&test_key(), &test_iv());
        cipher.skip(3);
        let debug = format!("{:?}", cipher);
        assert!(debug.contains("position: 3"));
        assert!(!debug.contains("key"));
    }
}
