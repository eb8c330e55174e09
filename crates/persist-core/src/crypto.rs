//! AES-256-CBC payload encoding under a pre-shared key.
//!
//! Wire format: `hex(iv) || hex(ciphertext)` with a fresh 16-byte IV per
//! message and PKCS#7 padding. This is bit-compatible with what a browser
//! produces through WebCrypto's `AES-CBC`, which is the only mode the agent
//! side is guaranteed to have.

use std::fmt;

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Key length in bytes.
pub const KEY_LEN: usize = 32;
/// IV length in bytes.
pub const IV_LEN: usize = 16;
/// Length of the hex-encoded IV prefix of a token.
pub const IV_HEX_LEN: usize = IV_LEN * 2;

const BLOCK_LEN: usize = 16;

/// Crypto error.
#[derive(Debug, Error, PartialEq)]
pub enum CryptoError {
    #[error("Token is too short or not block aligned")]
    Malformed,
    #[error("Token is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("Bad padding (wrong key or corrupted token)")]
    Padding,
    #[error("Plaintext is not valid UTF-8")]
    Utf8,
}

/// A 256-bit pre-shared key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Parse a stored key.
    ///
    /// Only exactly 64 hex characters are accepted; anything else means
    /// encryption is not configured.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() != KEY_LEN * 2 {
            return None;
        }
        let mut key = [0u8; KEY_LEN];
        hex::decode_to_slice(raw, &mut key).ok()?;
        Some(Self(key))
    }

    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Lowercase hex rendering, as stored in settings.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
#[must_use]
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> String {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.0.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut token = hex::encode(iv);
    token.push_str(&hex::encode(ciphertext));
    token
}

/// Decrypt a token, returning `None` if the plaintext cannot be recovered.
#[must_use]
pub fn decrypt(token: &str, key: &EncryptionKey) -> Option<String> {
    match try_decrypt(token, key) {
        Ok(plaintext) => Some(plaintext),
        Err(e) => {
            tracing::debug!("Decryption failed: {e}");
            None
        }
    }
}

/// Decrypt a token, reporting why recovery failed.
///
/// # Errors
/// Returns an error for malformed tokens, wrong keys, or non-UTF-8 plaintext.
pub fn try_decrypt(token: &str, key: &EncryptionKey) -> Result<String, CryptoError> {
    // Non-ASCII input cannot be hex and would make the split below unsound.
    if !token.is_ascii() || token.len() < IV_HEX_LEN + BLOCK_LEN * 2 {
        return Err(CryptoError::Malformed);
    }
    let (iv_hex, body_hex) = token.split_at(IV_HEX_LEN);

    let mut iv = [0u8; IV_LEN];
    hex::decode_to_slice(iv_hex, &mut iv)?;
    let body = hex::decode(body_hex)?;
    if body.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::Malformed);
    }

    let plaintext = Aes256CbcDec::new(&key.0.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&body)
        .map_err(|_| CryptoError::Padding)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

/// Whether `payload` has the shape of an encrypted token.
///
/// Used by agents to decide whether a command needs decrypting. A plain
/// command that happens to be block-aligned hex is indistinguishable and
/// will fail decryption instead.
#[must_use]
pub fn looks_encrypted(payload: &str) -> bool {
    payload.len() >= IV_HEX_LEN + BLOCK_LEN * 2
        && (payload.len() - IV_HEX_LEN) % (BLOCK_LEN * 2) == 0
        && payload.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn key() -> EncryptionKey {
        EncryptionKey::parse(KEY_HEX).unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_text() {
        let key = key();
        let long = "x".repeat(1000);
        for text in ["alert(1)", "", "document.cookie", "héllo wörld ✓", long.as_str()] {
            let token = encrypt(text, &key);
            assert_eq!(decrypt(&token, &key).as_deref(), Some(text));
        }
    }

    #[test]
    fn test_token_length_matches_padded_ciphertext() {
        let key = key();
        // 8 bytes pads to one block, 16 bytes pads to two.
        assert_eq!(encrypt("alert(1)", &key).len(), IV_HEX_LEN + 2 * 16);
        assert_eq!(encrypt("0123456789abcdef", &key).len(), IV_HEX_LEN + 2 * 32);
    }

    #[test]
    fn test_fresh_iv_per_message() {
        let key = key();
        let a = encrypt("alert(1)", &key);
        let b = encrypt("alert(1)", &key);
        assert_ne!(a[..IV_HEX_LEN], b[..IV_HEX_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypts_known_legacy_token() {
        // Produced by `openssl enc -aes-256-cbc` with the same key and IV
        // 0f0e..00, matching the legacy browser payload's format.
        let token = concat!(
            "0f0e0d0c0b0a09080706050403020100",
            "77123fe2e6ecc5243335a40765b2377d78eb27971632ae040780f91eb121f664"
        );
        assert_eq!(
            decrypt(token, &key()).as_deref(),
            Some("alert(document.domain)")
        );
    }

    #[test]
    fn test_wrong_key_fails_without_panicking() {
        let token = encrypt("alert(1)", &key());
        let other = EncryptionKey::generate();
        assert_eq!(decrypt(&token, &other), None);
    }

    #[test]
    fn test_malformed_tokens_fail() {
        let key = key();
        let token = encrypt("alert(1)", &key);

        assert_eq!(try_decrypt("", &key), Err(CryptoError::Malformed));
        assert_eq!(try_decrypt(&token[..40], &key), Err(CryptoError::Malformed));
        assert_eq!(try_decrypt(&token[..token.len() - 2], &key), Err(CryptoError::Malformed));
        assert_eq!(try_decrypt(&"é".repeat(40), &key), Err(CryptoError::Malformed));
        assert!(matches!(
            try_decrypt(&"zz".repeat(40), &key),
            Err(CryptoError::Hex(_))
        ));
        assert_eq!(decrypt("alert(1)", &key), None);
    }

    #[test]
    fn test_key_parse_rules() {
        assert!(EncryptionKey::parse(KEY_HEX).is_some());
        assert!(EncryptionKey::parse(&KEY_HEX.to_uppercase()).is_some());
        assert!(EncryptionKey::parse("").is_none());
        assert!(EncryptionKey::parse(&KEY_HEX[..62]).is_none());
        assert!(EncryptionKey::parse(&format!("{KEY_HEX}00")).is_none());
        assert!(EncryptionKey::parse(&"g".repeat(64)).is_none());
    }

    #[test]
    fn test_generated_key_renders_as_parseable_hex() {
        let key = EncryptionKey::generate();
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(EncryptionKey::parse(&hex), Some(key));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        assert_eq!(format!("{:?}", key()), "EncryptionKey(..)");
    }

    #[test]
    fn test_looks_encrypted() {
        let key = key();
        assert!(looks_encrypted(&encrypt("alert(1)", &key)));
        assert!(looks_encrypted(&encrypt(&"a".repeat(100), &key)));
        assert!(!looks_encrypted("alert(1)"));
        assert!(!looks_encrypted(&"ab".repeat(20)));
        assert!(!looks_encrypted(&format!("{}zz", "ab".repeat(31))));
    }
}
