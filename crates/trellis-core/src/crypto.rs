//! AEAD facade over the two ciphers spoken by module event managers
//!
//! Both ciphers expose the same surface: `encrypt` returns ciphertext with
//! the authentication tag appended, `decrypt` strips and verifies it, and
//! `mac` is the tag of an empty plaintext. AES-GCM runs with a fixed all-zero
//! IV; every associated-data block carries a monotone per-module nonce, which
//! is what makes each `(key, AD)` pair unique.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Nonce,
};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::spongent;

/// AES-GCM authentication tag length
const AES_TAG_SIZE: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD tag verification failed")]
    DecryptionFailed,
    #[error("ciphertext shorter than the authentication tag")]
    TruncatedCiphertext,
    #[error("no matching encryption type for {0:?}")]
    UnknownCipher(String),
}

/// Cipher selector, as it appears on the wire (one byte)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encryption {
    Aes = 0x01,
    Spongent = 0x02,
}

impl Encryption {
    /// Parse the descriptor spelling ("aes"/"spongent", case-insensitive)
    pub fn from_str_tag(s: &str) -> Result<Self, CryptoError> {
        match s.to_lowercase().as_str() {
            "aes" => Ok(Self::Aes),
            "spongent" => Ok(Self::Spongent),
            _ => Err(CryptoError::UnknownCipher(s.to_string())),
        }
    }

    /// Descriptor spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes => "aes",
            Self::Spongent => "spongent",
        }
    }

    /// Key size in bytes
    pub fn key_size(&self) -> usize {
        match self {
            Self::Aes => 16,
            Self::Spongent => spongent::KEY_SIZE,
        }
    }

    /// Tag size in bytes
    pub fn tag_size(&self) -> usize {
        match self {
            Self::Aes => AES_TAG_SIZE,
            Self::Spongent => spongent::TAG_SIZE,
        }
    }

    /// Encrypt `data` under `key`, binding `ad`. Returns `cipher || tag`.
    pub fn encrypt(&self, key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Aes => encrypt_aes(key, ad, data),
            Self::Spongent => spongent::wrap(key, ad, data),
        }
    }

    /// Decrypt `cipher || tag`, verifying the tag against `key` and `ad`.
    pub fn decrypt(&self, key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Aes => decrypt_aes(key, ad, data),
            Self::Spongent => spongent::unwrap(key, ad, data),
        }
    }

    /// MAC of `ad` alone: the tag of an empty plaintext.
    pub fn mac(&self, key: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(key, ad, &[])
    }
}

impl std::fmt::Display for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constant-time byte-slice comparison for MAC/tag checks.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn aes_cipher(key: &[u8]) -> Result<Aes128Gcm, CryptoError> {
    Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 16,
        got: key.len(),
    })
}

fn encrypt_aes(key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = aes_cipher(key)?;
    // Zero IV: uniqueness is delegated to the nonce carried in `ad`.
    let nonce = Nonce::from_slice(&[0u8; 12]);
    cipher
        .encrypt(nonce, Payload { msg: data, aad: ad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

fn decrypt_aes(key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < AES_TAG_SIZE {
        return Err(CryptoError::TruncatedCiphertext);
    }
    let cipher = aes_cipher(key)?;
    let nonce = Nonce::from_slice(&[0u8; 12]);
    cipher
        .decrypt(nonce, Payload { msg: data, aad: ad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_names_roundtrip() {
        for enc in [Encryption::Aes, Encryption::Spongent] {
            assert_eq!(Encryption::from_str_tag(enc.as_str()).unwrap(), enc);
        }
        assert_eq!(Encryption::from_str_tag("AES").unwrap(), Encryption::Aes);
        assert!(Encryption::from_str_tag("chacha").is_err());
    }

    #[test]
    fn test_wire_selectors() {
        assert_eq!(Encryption::Aes as u8, 0x01);
        assert_eq!(Encryption::Spongent as u8, 0x02);
    }

    #[test]
    fn test_aes_roundtrip() {
        let key = [0x42u8; 16];
        let ad = b"\x01\x00\x07\x00\x05\x00\x00";
        let data = b"connection key material";

        let cipher = Encryption::Aes.encrypt(&key, ad, data).unwrap();
        assert_eq!(cipher.len(), data.len() + 16);

        let plain = Encryption::Aes.decrypt(&key, ad, &cipher).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn test_aes_rejects_altered_ad() {
        let key = [0x42u8; 16];
        let ad = [0x01, 0x00, 0x07, 0x00, 0x05, 0x00, 0x00];
        let cipher = Encryption::Aes.encrypt(&key, &ad, b"secret").unwrap();

        let mut bad_ad = ad;
        *bad_ad.last_mut().unwrap() = 0x01;
        assert!(matches!(
            Encryption::Aes.decrypt(&key, &bad_ad, &cipher),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_aes_rejects_bit_flips() {
        let key = [7u8; 16];
        let ad = b"ad";
        let cipher = Encryption::Aes.encrypt(&key, ad, b"payload").unwrap();

        for i in 0..cipher.len() {
            let mut tampered = cipher.clone();
            tampered[i] ^= 0x80;
            assert!(Encryption::Aes.decrypt(&key, ad, &tampered).is_err());
        }
    }

    #[test]
    fn test_aes_mac_is_tag_only() {
        let key = [1u8; 16];
        let mac = Encryption::Aes.mac(&key, b"challenge").unwrap();
        assert_eq!(mac.len(), 16);
    }

    #[test]
    fn test_aes_wrong_key_length() {
        assert!(matches!(
            Encryption::Aes.encrypt(&[0u8; 12], b"", b""),
            Err(CryptoError::InvalidKeyLength { expected: 16, got: 12 })
        ));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abcd", b"abcd"));
        assert!(!ct_eq(b"abcd", b"abce"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }
}
