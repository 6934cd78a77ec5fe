//! Serialize/deserialize and encrypt/decrypt the account archive.
//!
//! Header byte selects the encryption scheme: `0x00` gzip plaintext,
//! `0x01` password (AES-GCM over `scrypt(password, salt)`), `0x02` raw key
//! (AES-GCM with an externally supplied key). The scheme is recorded in the
//! file so readers never have to guess it.

use aes_gcm::aead::{Aead, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rand::RngCore;
use std::io::{Read, Write};

use super::AccountArchive;
use crate::error::ArchiveError;

const SCHEME_NONE: u8 = 0x00;
const SCHEME_PASSWORD: u8 = 0x01;
const SCHEME_KEY: u8 = 0x02;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// The encryption scheme an archive is stored under.
#[derive(Debug, Clone)]
pub enum EncryptionScheme {
    None,
    Password(String),
    Key([u8; 32]),
}

/// Encode an archive to canonical, insignificant-whitespace-free JSON.
pub fn serialize(archive: &AccountArchive) -> Result<Vec<u8>, ArchiveError> {
    serde_json::to_vec(archive).map_err(|e| ArchiveError::Io(e.to_string()))
}

/// Decode an archive. Unknown top-level keys are tolerated (captured in
/// `unknown`); a document that isn't even a JSON object fails with
/// `Malformed`.
pub fn deserialize(bytes: &[u8]) -> Result<AccountArchive, ArchiveError> {
    serde_json::from_slice(bytes).map_err(|_| ArchiveError::Malformed)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ArchiveError::Io(e.to_string()))?;
    encoder.finish().map_err(|e| ArchiveError::Io(e.to_string()))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| ArchiveError::Malformed)?;
    Ok(out)
}

fn derive_key_from_password(password: &str, salt: &[u8; SALT_LEN]) -> [u8; 32] {
    let params = scrypt::Params::new(15, 8, 1, 32).expect("static scrypt params are valid");
    let mut key = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut key)
        .expect("scrypt output length matches key buffer");
    key
}

fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    AeadOsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-GCM encryption over a fresh nonce cannot fail");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

fn aead_decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    if data.len() < NONCE_LEN {
        return Err(ArchiveError::BadCredentials);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| ArchiveError::BadCredentials)
}

/// Write an archive to its on-disk byte representation under the given
/// scheme: header byte, then (compressed, then encrypted) canonical JSON.
pub fn write_archive(archive: &AccountArchive, scheme: &EncryptionScheme) -> Result<Vec<u8>, ArchiveError> {
    let json = serialize(archive)?;
    let compressed = gzip(&json)?;

    match scheme {
        EncryptionScheme::None => {
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(SCHEME_NONE);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        EncryptionScheme::Password(password) => {
            let mut salt = [0u8; SALT_LEN];
            AeadOsRng.fill_bytes(&mut salt);
            let key = derive_key_from_password(password, &salt);
            let ciphertext = aead_encrypt(&key, &compressed);
            let mut out = Vec::with_capacity(1 + SALT_LEN + ciphertext.len());
            out.push(SCHEME_PASSWORD);
            out.extend_from_slice(&salt);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
        EncryptionScheme::Key(key) => {
            let ciphertext = aead_encrypt(key, &compressed);
            let mut out = Vec::with_capacity(1 + ciphertext.len());
            out.push(SCHEME_KEY);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
    }
}

/// Read an archive back. `password` is required iff the file records the
/// password scheme; `key` iff it records the raw-key scheme. A scheme
/// mismatch or a wrong password/key fails with `ArchiveBadCredentials`.
pub fn read_archive(
    bytes: &[u8],
    password: Option<&str>,
    key: Option<&[u8; 32]>,
) -> Result<AccountArchive, ArchiveError> {
    let (&scheme_byte, rest) = bytes.split_first().ok_or(ArchiveError::Malformed)?;

    let compressed = match scheme_byte {
        SCHEME_NONE => rest.to_vec(),
        SCHEME_PASSWORD => {
            let password = password.ok_or(ArchiveError::BadCredentials)?;
            if rest.len() < SALT_LEN {
                return Err(ArchiveError::Malformed);
            }
            let (salt_bytes, ciphertext) = rest.split_at(SALT_LEN);
            let mut salt = [0u8; SALT_LEN];
            salt.copy_from_slice(salt_bytes);
            let derived = derive_key_from_password(password, &salt);
            aead_decrypt(&derived, ciphertext)?
        }
        SCHEME_KEY => {
            let key = key.ok_or(ArchiveError::BadCredentials)?;
            aead_decrypt(key, rest)?
        }
        _ => return Err(ArchiveError::Malformed),
    };

    let json = gunzip(&compressed)?;
    deserialize(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_archive() -> AccountArchive {
        let mut archive = AccountArchive::default();
        archive
            .config_kv
            .insert("displayName".to_string(), "Alice".to_string());
        archive
    }

    #[test]
    fn round_trips_with_no_encryption() {
        let archive = sample_archive();
        let bytes = write_archive(&archive, &EncryptionScheme::None).unwrap();
        let restored = read_archive(&bytes, None, None).unwrap();
        assert_eq!(restored.config_kv, archive.config_kv);
    }

    #[test]
    fn round_trips_with_password() {
        let archive = sample_archive();
        let scheme = EncryptionScheme::Password("correct horse battery staple".to_string());
        let bytes = write_archive(&archive, &scheme).unwrap();
        let restored = read_archive(&bytes, Some("correct horse battery staple"), None).unwrap();
        assert_eq!(restored.config_kv, archive.config_kv);
    }

    #[test]
    fn wrong_password_fails() {
        let archive = sample_archive();
        let scheme = EncryptionScheme::Password("right-password".to_string());
        let bytes = write_archive(&archive, &scheme).unwrap();
        let result = read_archive(&bytes, Some("wrong-password"), None);
        assert!(matches!(result, Err(ArchiveError::BadCredentials)));
    }

    #[test]
    fn malformed_top_level_document_fails() {
        let result = deserialize(b"not json");
        assert!(matches!(result, Err(ArchiveError::Malformed)));
    }

    #[test]
    fn unknown_keys_are_tolerated_and_preserved() {
        let mut archive = sample_archive();
        let json = serialize(&archive).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        value["futureField"] = serde_json::json!("future-value");
        let with_unknown = serde_json::to_vec(&value).unwrap();

        let restored = deserialize(&with_unknown).unwrap();
        assert_eq!(
            restored.unknown.get("futureField"),
            Some(&serde_json::json!("future-value"))
        );
        archive.unknown.clear();
    }
}
