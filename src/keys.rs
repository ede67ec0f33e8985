use std::fmt;

use sodiumoxide::utils::memzero;
use thiserror::Error;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

pub const KEY_ENV_VAR: &str = "ENCRYPTION_KEY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("environment variable ENCRYPTION_KEY is not set")]
    Missing,

    #[error("ENCRYPTION_KEY must be 64 hex characters, got {0}")]
    WrongLength(usize),

    #[error("ENCRYPTION_KEY is not valid hex")]
    NotHex,
}

/// The process-wide at-rest key. Loaded once at startup and shared behind an `Arc`.
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_env() -> Result<Self, KeyError> {
        let value = std::env::var(KEY_ENV_VAR).map_err(|_| KeyError::Missing)?;
        Self::from_hex(&value)
    }

    pub fn from_hex(value: &str) -> Result<Self, KeyError> {
        let value = value.trim();
        if value.len() != KEY_LEN * 2 {
            return Err(KeyError::WrongLength(value.len()));
        }

        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(value, &mut bytes).map_err(|_| KeyError::NotHex)?;
        Ok(EncryptionKey(bytes))
    }

    #[cfg(test)]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        sodiumoxide::randombytes::randombytes_into(&mut bytes);
        EncryptionKey(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        memzero(&mut self.0);
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_parses_64_hex_chars() {
        let key = EncryptionKey::from_hex(SAMPLE).unwrap();
        assert_eq!(key.as_bytes()[0], 0x00);
        assert_eq!(key.as_bytes()[31], 0x1f);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert_eq!(
            EncryptionKey::from_hex(&SAMPLE[..62]).unwrap_err(),
            KeyError::WrongLength(62)
        );
        assert_eq!(
            EncryptionKey::from_hex("").unwrap_err(),
            KeyError::WrongLength(0)
        );
    }

    #[test]
    fn test_rejects_non_hex() {
        let bad = "zz".repeat(KEY_LEN);
        assert_eq!(EncryptionKey::from_hex(&bad).unwrap_err(), KeyError::NotHex);
    }

    #[test]
    fn test_debug_never_prints_material() {
        let key = EncryptionKey::from_hex(SAMPLE).unwrap();
        let printed = format!("{:?}", key);
        assert!(!printed.contains("0102"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_generated_keys_differ() {
        sodiumoxide::init().unwrap();
        let a = EncryptionKey::generate();
        let b = EncryptionKey::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
