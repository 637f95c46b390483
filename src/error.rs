use thiserror::Error;

/// The error taxonomy for the core: one variant per Kind in the failure
/// model (spec §7). Every fallible operation in the scheduler, shard, cell
/// and key-sequence cipher surfaces one of these to its direct caller; the
/// core never swallows an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("access denied: {0}")]
    Access(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("conflict writing shard {0}")]
    Conflict(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("counter error: {0}")]
    Counter(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("key parse error: {0}")]
    ParseKey(String),

    #[error("missing key: seq {0}")]
    MissingKey(u32),

    #[error("missing: {0}")]
    Missing(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("schedule error: {0}")]
    Schedule(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Corrupt(format!("json: {err}"))
    }
}

impl From<base64::DecodeError> for CoreError {
    fn from(err: base64::DecodeError) -> Self {
        CoreError::Corrupt(format!("base64: {err}"))
    }
}
