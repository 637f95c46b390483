//! HMAC-SHA-256 with 512-bit keys (spec §6). Used to authenticate the
//! `KeySequenceCipher`'s serialized key ring and counter state.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CoreError, CoreResult};

pub const KEY_LEN: usize = 64;
pub const TAG_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

pub fn sign(key: &[u8; KEY_LEN], message: &[u8]) -> [u8; TAG_LEN] {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&result);
    out
}

pub fn verify(key: &[u8; KEY_LEN], message: &[u8], tag: &[u8]) -> CoreResult<()> {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.verify_slice(tag)
        .map_err(|_| CoreError::AuthFailed("HMAC verification failed".into()))
}
