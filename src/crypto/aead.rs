//! AES-256-GCM sealing. The 96-bit IV is prepended to the ciphertext on
//! seal and stripped on open, so the stored blob is self-describing and a
//! `Cell` never needs to track an IV alongside its ciphertext bytes — this
//! is what makes `Cell::serialize` idempotent on unmodified cells (spec
//! §4.3/§9): the IV is baked into the bytes the cell already holds.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::{CoreError, CoreResult};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// A fresh AES-256 key from the OS CSPRNG, zeroized on drop once the caller
/// is done with it (the key cell re-encrypts it before it ever touches
/// storage, but the raw bytes shouldn't linger in memory past that).
pub fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut *key);
    key
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seal `plaintext` under `key`, binding `aad`. Returns `nonce ‖ ciphertext‖tag`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> CoreResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CoreError::Corrupt(format!("bad AES key: {e}")))?;
    let nonce_bytes = random_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CoreError::Corrupt(format!("seal failed: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a blob previously produced by `seal`, checking `aad`. Any AAD/key
/// mismatch or tampering surfaces as `CoreError::Decrypt`.
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8], aad: &[u8]) -> CoreResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(CoreError::Corrupt("ciphertext shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CoreError::Corrupt(format!("bad AES key: {e}")))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CoreError::Decrypt("AEAD open failed".into()))
}

/// Number of AES blocks an AES-256-GCM encryption of `nbytes` plaintext
/// consumes, including the GCM counter-mode initial block (spec §4.4).
pub fn block_count(nbytes: usize) -> u64 {
    1 + ((8 * nbytes as u64) + 127) / 128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = random_key();
        let aad = b"context";
        let sealed = seal(&key, b"hello world", aad).unwrap();
        let opened = open(&key, &sealed, aad).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn aad_mismatch_fails_decrypt() {
        let key = random_key();
        let sealed = seal(&key, b"hello", b"aad-a").unwrap();
        let err = open(&key, &sealed, b"aad-b").unwrap_err();
        assert!(matches!(err, CoreError::Decrypt(_)));
    }

    #[test]
    fn wrong_key_fails_decrypt() {
        let sealed = seal(&random_key(), b"hello", b"aad").unwrap();
        let err = open(&random_key(), &sealed, b"aad").unwrap_err();
        assert!(matches!(err, CoreError::Decrypt(_)));
    }

    #[test]
    fn seal_is_not_deterministic_but_open_recovers() {
        let key = random_key();
        let a = seal(&key, b"same", b"aad").unwrap();
        let b = seal(&key, b"same", b"aad").unwrap();
        assert_ne!(a, b, "fresh IV per seal");
        assert_eq!(open(&key, &a, b"aad").unwrap(), b"same");
        assert_eq!(open(&key, &b, b"aad").unwrap(), b"same");
    }

    #[test]
    fn block_count_matches_formula() {
        assert_eq!(block_count(0), 1);
        assert_eq!(block_count(16), 2);
    }
}
