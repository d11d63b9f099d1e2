use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 600_000;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: ciphertext or tag invalid")]
    Decrypt,
}

/// On-disk/at-rest shape of one encrypted credential record, matching the
/// persisted-state layout: salt + iv + ciphertext (tag appended by AEAD).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub v: u8,
    pub salt: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

fn derive_key(password: &[u8], salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<sha2::Sha512>(password, salt, PBKDF2_ROUNDS, key.as_mut());
    key
}

/// Encrypts `plaintext` under a key derived from `password` via
/// PBKDF2-HMAC-SHA512, using a freshly generated salt and IV per call.
pub fn encrypt(password: &[u8], plaintext: &[u8]) -> Result<EncryptedRecord, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| CryptoError::Encrypt)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    Ok(EncryptedRecord {
        v: 1,
        salt: salt.to_vec(),
        iv: iv.to_vec(),
        ciphertext,
    })
}

/// Decrypts a record previously produced by [`encrypt`] with the same
/// password. Returns `Decrypt` on a wrong password or a tampered record —
/// AES-GCM's tag check makes these indistinguishable, which is intentional.
pub fn decrypt(password: &[u8], record: &EncryptedRecord) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let key = derive_key(password, &record.salt);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| CryptoError::Decrypt)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&record.iv), record.ciphertext.as_ref())
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(Zeroizing::new(plaintext))
}

/// Last-4-hex-character fingerprint of a key, safe to log/emit in events.
pub fn fingerprint(secret: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let hex = hex::encode(digest);
    hex[hex.len() - 4..].to_string()
}

/// Constant-time string equality, used when comparing a freshly supplied
/// key against a stored one (e.g. during validation) to avoid timing leaks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let record = encrypt(b"correct horse", b"sk-secret-key").unwrap();
        let plaintext = decrypt(b"correct horse", &record).unwrap();
        assert_eq!(&*plaintext, b"sk-secret-key");
    }

    #[test]
    fn wrong_password_fails_decrypt() {
        let record = encrypt(b"correct horse", b"sk-secret-key").unwrap();
        assert!(decrypt(b"wrong password", &record).is_err());
    }

    #[test]
    fn salt_and_iv_are_fresh_per_call() {
        let a = encrypt(b"pw", b"same plaintext").unwrap();
        let b = encrypt(b"pw", b"same plaintext").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn fingerprint_is_four_hex_chars_and_never_the_key() {
        let fp = fingerprint("sk-abcdefghijklmnop");
        assert_eq!(fp.len(), 4);
        assert!(!fp.contains("sk-"));
    }
}
