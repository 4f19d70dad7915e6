//! Authenticated page encryption.
//!
//! AES-128-GCM with a fresh random nonce per stored buffer; the nonce is
//! written in front of the ciphertext. The 16-byte authentication tag means
//! tampered pages fail to decrypt instead of decoding to garbage.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Nonce};

use super::BackendError;
use super::transform::PageTransform;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct EncryptionTransform {
    cipher: Aes128Gcm,
}

impl EncryptionTransform {
    #[must_use]
    pub fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128Gcm::new(key.into()),
        }
    }
}

impl fmt::Debug for EncryptionTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionTransform").finish_non_exhaustive()
    }
}

impl PageTransform for EncryptionTransform {
    fn max_page_size_overhead(&self) -> u16 {
        (NONCE_LEN + TAG_LEN) as u16
    }

    fn transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, bytes)
            .map_err(|_| BackendError::new("page encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn reverse_transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(BackendError::new("encrypted page is too short"));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| BackendError::new("page decryption failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let transform = EncryptionTransform::new(&[7; 16]);
        let page = b"some page contents".to_vec();

        let stored = transform.transform(&page).unwrap();

        assert_eq!(stored.len(), page.len() + NONCE_LEN + TAG_LEN);
        assert_ne!(&stored[NONCE_LEN..], &page[..]);
        assert_eq!(transform.reverse_transform(&stored).unwrap(), page);
    }

    #[test]
    fn nonces_differ_between_writes() {
        let transform = EncryptionTransform::new(&[7; 16]);

        let a = transform.transform(b"page").unwrap();
        let b = transform.transform(b"page").unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn tampering_is_detected() {
        let transform = EncryptionTransform::new(&[7; 16]);
        let mut stored = transform.transform(b"page").unwrap();

        let last = stored.len() - 1;
        stored[last] ^= 1;

        assert!(transform.reverse_transform(&stored).is_err());
    }

    #[test]
    fn the_wrong_key_fails_to_decrypt() {
        let stored = EncryptionTransform::new(&[7; 16]).transform(b"page").unwrap();

        assert!(
            EncryptionTransform::new(&[8; 16])
                .reverse_transform(&stored)
                .is_err()
        );
    }

    #[test]
    fn short_buffers_are_rejected() {
        let transform = EncryptionTransform::new(&[7; 16]);

        assert!(transform.reverse_transform(&[0; 10]).is_err());
    }
}
