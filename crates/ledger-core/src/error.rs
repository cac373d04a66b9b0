use thiserror::Error;

/// Errors surfaced by the ledger store and the chain engine.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// A block with this index is already persisted.
    #[error("block {0} already exists")]
    DuplicateKey(u64),

    /// A transaction referenced a block that is not persisted.
    #[error("transaction references missing block {0}")]
    ForeignKeyViolation(u64),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("mining cancelled")]
    MiningCancelled,

    /// NaN and infinities all encode as `null`, so the digest could not
    /// tell them apart.
    #[error("amount {0} is not a finite number")]
    InvalidAmount(f64),

    #[error("difficulty {0} exceeds the digest width")]
    InvalidDifficulty(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// True when the store may be left in an unknown state and the caller
    /// should stop issuing writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Codec(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
