//! Narrow wrappers around the cryptographic primitives required by spec
//! §6: AES-256-GCM, HMAC-SHA-256 and PBKDF2-HMAC-SHA-256. Cell and
//! KeySequenceCipher never touch `aes_gcm`/`hmac`/`pbkdf2` directly; they
//! go through these functions, mirroring how the teacher keeps
//! crate-specific calls behind a handful of functions rather than
//! scattering them through callers.

pub mod aead;
pub mod kdf;
pub mod mac;
