//! PBKDF2-HMAC-SHA-256, producing 256-bit keys (spec §6). The password is
//! NFKD-normalised before use so that visually/confusably equivalent
//! Unicode passwords derive the same key regardless of the normalization
//! form the caller happened to type it in.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use unicode_normalization::UnicodeNormalization;

use crate::config::KdfConfig;

pub const KEY_LEN: usize = 32;

pub fn derive_key(password: &str, salt: &[u8], config: &KdfConfig) -> [u8; KEY_LEN] {
    let normalized: String = password.nfkd().collect();
    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(normalized.as_bytes(), salt, config.iterations, &mut out);
    out
}
