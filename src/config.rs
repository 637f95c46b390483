//! Tunables for the scheduler and the key-sequence cipher. Password
//! bootstrapping (salt storage, iteration persistence) lives outside the
//! core per spec §1; the PBKDF2 constants below are kept here because the
//! core is the thing that actually calls the KDF.

use serde::{Deserialize, Serialize};

/// Scheduler placement tunables (spec §4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// How far (in depth) a candidate group may sit from the desired depth
    /// before a new group is created instead of reusing one.
    pub depth_limit: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { depth_limit: 2 }
    }
}

/// Per-algorithm usage ceilings that force a `KeySequenceCipher` to roll to
/// a fresh key (spec §4.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CipherLimits {
    /// Messages encrypted under one key before rollover.
    pub max_messages: u64,
    /// AES blocks (including the GCM counter block) consumed under one key.
    pub max_blocks: u64,
}

impl CipherLimits {
    /// The limits mandated by spec §4.4 for AES-256-GCM.
    pub const fn aes_256_gcm() -> Self {
        Self {
            max_messages: 1 << 31,
            max_blocks: 1 << 47,
        }
    }
}

impl Default for CipherLimits {
    fn default() -> Self {
        Self::aes_256_gcm()
    }
}

/// PBKDF2-HMAC-SHA-256 parameters the core applies when deriving a key
/// from a password (spec §6). The salt and iteration count themselves are
/// stored by the config bootstrapping layer outside the core.
#[derive(Debug, Clone, Copy)]
pub struct KdfConfig {
    pub iterations: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        // Matches the floor OWASP recommends for PBKDF2-HMAC-SHA-256 as of
        // this writing; the config layer may raise it per deployment.
        Self { iterations: 600_000 }
    }
}
