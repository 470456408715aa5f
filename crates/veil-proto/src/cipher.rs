//! Per-request stream cipher
//!
//! The master key is SHA-256 of the configured secret. Every request derives
//! its own ChaCha20 key from `SHA-256(master || iv || label)`, so keystreams
//! used for the envelope, sealed headers and relayed bytes never overlap.

use crate::request::Iv;
use cryptoxide::chacha20::ChaCha20;
use sha2::{Digest, Sha256};
use std::fmt;

const ENVELOPE_LABEL: &[u8] = b"envelope";
const HEADER_LABEL: &[u8] = b"headers";

/// Shared cipher holding the master key
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl Cipher {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Keystream for relayed bytes of a request
    pub fn stream(&self, iv: &Iv) -> CipherStream {
        self.derive(iv, b"")
    }

    /// Keystream for the sealed header block of a request
    pub fn header_stream(&self, iv: &Iv) -> CipherStream {
        self.derive(iv, HEADER_LABEL)
    }

    pub(crate) fn envelope_stream(&self, iv: &Iv) -> CipherStream {
        self.derive(iv, ENVELOPE_LABEL)
    }

    /// First `len` bytes of SHA-256(master || iv || data)
    pub(crate) fn tag(&self, iv: &Iv, data: &[u8], len: usize) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(iv);
        hasher.update(data);
        hasher.finalize()[..len].to_vec()
    }

    fn derive(&self, iv: &Iv, label: &[u8]) -> CipherStream {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(iv);
        hasher.update(label);
        let digest = hasher.finalize();

        let mut request_key = [0u8; 32];
        request_key.copy_from_slice(&digest);

        CipherStream {
            inner: ChaCha20::new(&request_key, &iv[..12]),
        }
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").field("key", &"<redacted>").finish()
    }
}

/// A positioned keystream; applying it twice from the same offset is the identity
pub struct CipherStream {
    inner: ChaCha20,
}

impl CipherStream {
    /// XOR the keystream into `buf` in place and advance
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.process_mut(buf);
    }
}

impl fmt::Debug for CipherStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_round_trip() {
        let cipher = Cipher::new("secret");
        let iv = [7u8; 16];

        let mut data = b"hello tunnel".to_vec();
        cipher.stream(&iv).apply(&mut data);
        assert_ne!(&data[..], b"hello tunnel");

        cipher.stream(&iv).apply(&mut data);
        assert_eq!(&data[..], b"hello tunnel");
    }

    #[test]
    fn test_stream_is_positioned() {
        let cipher = Cipher::new("secret");
        let iv = [1u8; 16];

        let mut whole = b"abcdefgh".to_vec();
        cipher.stream(&iv).apply(&mut whole);

        let mut split = b"abcdefgh".to_vec();
        let mut stream = cipher.stream(&iv);
        let (head, tail) = split.split_at_mut(3);
        stream.apply(head);
        stream.apply(tail);

        assert_eq!(whole, split);
    }

    #[test]
    fn test_labels_give_distinct_keystreams() {
        let cipher = Cipher::new("secret");
        let iv = [3u8; 16];

        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        cipher.stream(&iv).apply(&mut a);
        cipher.header_stream(&iv).apply(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_keys_differ() {
        let iv = [9u8; 16];
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        Cipher::new("one").stream(&iv).apply(&mut a);
        Cipher::new("two").stream(&iv).apply(&mut b);
        assert_ne!(a, b);
    }
}
