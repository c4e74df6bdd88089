//! Credential vault: authenticated encryption for per-tenant secrets.
//!
//! Channel API credentials and FFN OAuth material never hit the database in
//! the clear. The wire form is `iv:authTag:body`, all hex, exactly three
//! segments, so legacy plaintext rows are structurally distinguishable and
//! can be passed through by `safe_decrypt` until they get rewritten.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::SyncError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialVault")
    }
}

impl CredentialVault {
    /// Build the vault from the 64-hex-char process key (`ENCRYPTION_KEY`).
    pub fn from_hex_key(key_hex: &str) -> Result<Self, SyncError> {
        let key_bytes = hex::decode(key_hex.trim())
            .map_err(|e| SyncError::Crypto(format!("ENCRYPTION_KEY is not hex: {e}")))?;
        if key_bytes.len() != 32 {
            return Err(SyncError::Crypto(format!(
                "ENCRYPTION_KEY must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SyncError> {
        let mut iv = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SyncError::Crypto("encryption failed".into()))?;

        // aes-gcm appends the tag to the ciphertext; the wire form carries it
        // as its own segment.
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(body)
        ))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, SyncError> {
        let (iv, tag, body) = parse_segments(ciphertext)
            .ok_or_else(|| SyncError::Crypto("malformed ciphertext".into()))?;

        let nonce = Nonce::from_slice(&iv);
        let mut sealed = body;
        sealed.extend_from_slice(&tag);

        let plain = self
            .cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| SyncError::Crypto("decryption failed (bad key or tampered data)".into()))?;

        String::from_utf8(plain).map_err(|_| SyncError::Crypto("decrypted value is not UTF-8".into()))
    }

    /// Decrypt when the value is a well-formed ciphertext, otherwise hand the
    /// input back unchanged. Legacy rows predate the vault.
    pub fn safe_decrypt(&self, value: &str) -> Result<String, SyncError> {
        if Self::is_encrypted(value) {
            self.decrypt(value)
        } else {
            Ok(value.to_string())
        }
    }

    /// Structural check mirroring the wire form: three hex segments with the
    /// expected iv/tag lengths.
    pub fn is_encrypted(value: &str) -> bool {
        parse_segments(value).is_some()
    }
}

fn parse_segments(value: &str) -> Option<([u8; NONCE_LEN], Vec<u8>, Vec<u8>)> {
    let mut parts = value.split(':');
    let iv_hex = parts.next()?;
    let tag_hex = parts.next()?;
    let body_hex = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let iv = hex::decode(iv_hex).ok()?;
    let tag = hex::decode(tag_hex).ok()?;
    let body = hex::decode(body_hex).ok()?;
    if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return None;
    }

    let mut iv_arr = [0u8; NONCE_LEN];
    iv_arr.copy_from_slice(&iv);
    Some((iv_arr, tag, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn vault() -> CredentialVault {
        CredentialVault::from_hex_key(TEST_KEY).expect("valid key")
    }

    #[test]
    fn roundtrip() {
        let v = vault();
        let secret = "ck_live_abcdef:cs_live_123456";
        let sealed = v.encrypt(secret).unwrap();
        assert!(CredentialVault::is_encrypted(&sealed));
        assert_eq!(v.decrypt(&sealed).unwrap(), secret);
    }

    #[test]
    fn ciphertexts_are_salted() {
        let v = vault();
        let a = v.encrypt("same").unwrap();
        let b = v.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn safe_decrypt_passes_legacy_plaintext_through() {
        let v = vault();
        assert_eq!(v.safe_decrypt("plain-api-key").unwrap(), "plain-api-key");
        // Colon-separated but not hex / wrong lengths.
        assert_eq!(v.safe_decrypt("a:b:c").unwrap(), "a:b:c");
        assert_eq!(
            v.safe_decrypt("deadbeef:deadbeef:deadbeef").unwrap(),
            "deadbeef:deadbeef:deadbeef"
        );
    }

    #[test]
    fn tampered_body_fails_auth() {
        let v = vault();
        let sealed = v.encrypt("secret").unwrap();
        let mut parts: Vec<String> = sealed.split(':').map(String::from).collect();
        let flipped = if parts[2].starts_with('0') { "1" } else { "0" };
        parts[2].replace_range(0..1, flipped);
        let tampered = parts.join(":");
        assert!(v.decrypt(&tampered).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let v = vault();
        let sealed = v.encrypt("secret").unwrap();
        let other = CredentialVault::from_hex_key(
            "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(CredentialVault::from_hex_key("not-hex").is_err());
        assert!(CredentialVault::from_hex_key("deadbeef").is_err());
    }
}
