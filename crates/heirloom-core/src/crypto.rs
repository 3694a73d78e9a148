//! Share sealing
//!
//! Each secret share is encrypted to a single holder with AES-256-GCM.
//!
//! # Security Notes
//!
//! - The holder key is 256 bits, either random or derived with Argon2id from an
//!   escrow passphrase
//! - Every seal uses a fresh random nonce
//! - Associated data binds the ciphertext to its owner and share index
//! - Holder keys never appear in `Debug` output

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// Argon2id parameters for escrow passphrases (OWASP recommendations for 2024+)
const ARGON2_M_COST: u32 = 65536; // 64 MiB
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 4;

/// Length of a holder key (AES-256)
pub const HOLDER_KEY_LEN: usize = 32;

/// Nonce length for AES-256-GCM
const NONCE_LEN: usize = 12;

/// GCM authentication tag length
const TAG_LEN: usize = 16;

/// Argon2 rejects salts shorter than this
const MIN_SALT_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Share authentication failed")]
    AuthenticationFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
    #[error("Invalid holder key: {0}")]
    InvalidKey(String),
    #[error("Invalid sealed share format")]
    InvalidFormat,
}

/// A symmetric key that a single share holder uses to open their share.
#[derive(Clone)]
pub struct HolderKey(Zeroizing<[u8; HOLDER_KEY_LEN]>);

impl HolderKey {
    /// Generate a fresh random holder key.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; HOLDER_KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; HOLDER_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a hex-encoded key (as stored in keyring files).
    pub fn from_hex(input: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(
            hex::decode(input.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        );
        if decoded.len() != HOLDER_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                HOLDER_KEY_LEN,
                decoded.len()
            )));
        }
        let mut bytes = Zeroizing::new([0u8; HOLDER_KEY_LEN]);
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Hex encoding, for writing keyring files during provisioning.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.0[..]))
    }

    /// Derive the escrow holder key from a passphrase with Argon2id.
    ///
    /// Used in self-only mode, where the third share is held by an escrow key
    /// rather than a trusted contact.
    pub fn derive_from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self, CryptoError> {
        if salt.len() < MIN_SALT_LEN {
            return Err(CryptoError::KeyDerivationFailed(format!(
                "salt must be at least {} bytes",
                MIN_SALT_LEN
            )));
        }

        let params = Params::new(
            ARGON2_M_COST,
            ARGON2_T_COST,
            ARGON2_P_COST,
            Some(HOLDER_KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; HOLDER_KEY_LEN]);
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        Ok(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0[..]))
    }
}

impl fmt::Debug for HolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HolderKey(<redacted>)")
    }
}

/// A share encrypted to its holder.
///
/// Wire format: `[nonce (12 bytes)][ciphertext + tag]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedShare {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl SealedShare {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        // At least one byte of payload plus the tag
        if bytes.len() < NONCE_LEN + TAG_LEN + 1 {
            return Err(CryptoError::InvalidFormat);
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);

        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_LEN..].to_vec(),
        })
    }
}

/// Seal share bytes to a holder.
///
/// `aad` is authenticated but not encrypted; callers pass the owner id and
/// share index so the ciphertext cannot be replayed under another row.
pub fn seal_share(key: &HolderKey, plaintext: &[u8], aad: &[u8]) -> Result<SealedShare, CryptoError> {
    let nonce_arr = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&nonce_arr);

    let ciphertext = key
        .cipher()
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(SealedShare { nonce, ciphertext })
}

/// Open a sealed share. Fails if the key is wrong, the ciphertext was
/// modified, or `aad` does not match what it was sealed with.
pub fn open_share(
    key: &HolderKey,
    sealed: &SealedShare,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    key.cipher()
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: sealed.ciphertext.as_slice(),
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = HolderKey::generate();
        let sealed = seal_share(&key, b"share bytes", b"owner-1:1").unwrap();
        let opened = open_share(&key, &sealed, b"owner-1:1").unwrap();
        assert_eq!(opened.as_slice(), b"share bytes");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal_share(&HolderKey::generate(), b"share", b"aad").unwrap();
        let result = open_share(&HolderKey::generate(), &sealed, b"aad");
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_aad_mismatch_fails() {
        // A share moved to a different owner/index must not open
        let key = HolderKey::generate();
        let sealed = seal_share(&key, b"share", b"owner-1:1").unwrap();
        assert!(open_share(&key, &sealed, b"owner-2:1").is_err());
        assert!(open_share(&key, &sealed, b"owner-1:2").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = HolderKey::generate();
        let sealed = seal_share(&key, b"share", b"aad").unwrap();
        let mut bytes = sealed.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let tampered = SealedShare::from_bytes(&bytes).unwrap();
        assert!(open_share(&key, &tampered, b"aad").is_err());
    }

    #[test]
    fn test_from_bytes_too_short() {
        assert!(matches!(
            SealedShare::from_bytes(&[0u8; NONCE_LEN + TAG_LEN]),
            Err(CryptoError::InvalidFormat)
        ));
    }

    #[test]
    fn test_hex_key_parsing() {
        let key = HolderKey::generate();
        let hex = key.to_hex();
        let parsed = HolderKey::from_hex(&hex).unwrap();

        let sealed = seal_share(&key, b"x", b"").unwrap();
        assert!(open_share(&parsed, &sealed, b"").is_ok());

        assert!(HolderKey::from_hex("abcd").is_err());
        assert!(HolderKey::from_hex("not hex").is_err());
    }

    #[test]
    fn test_passphrase_derivation_is_deterministic() {
        let salt = b"heirloom-escrow-salt";
        let a = HolderKey::derive_from_passphrase("correct horse", salt).unwrap();
        let b = HolderKey::derive_from_passphrase("correct horse", salt).unwrap();
        assert_eq!(a.to_hex(), b.to_hex());

        let c = HolderKey::derive_from_passphrase("wrong horse", salt).unwrap();
        assert_ne!(a.to_hex(), c.to_hex());
    }

    #[test]
    fn test_short_salt_rejected() {
        assert!(HolderKey::derive_from_passphrase("pw", b"short").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = HolderKey::from_bytes([0xAB; HOLDER_KEY_LEN]);
        let debug = format!("{:?}", key);
        assert!(!debug.contains("ab"));
        assert!(debug.contains("redacted"));
    }
}
