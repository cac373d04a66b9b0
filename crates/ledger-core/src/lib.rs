pub mod chain;
pub mod constants;
pub mod error;
pub mod mine;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{LedgerError, Result};

pub type Hash = [u8; 32];

/// A value transfer supplied by a caller, before it is assigned to a block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
}

impl TransferRecord {
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>, amount: f64) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            amount,
        }
    }

    /// Only finite amounts have a distinct canonical encoding.
    pub fn check_amount(&self) -> Result<()> {
        if !self.amount.is_finite() {
            return Err(LedgerError::InvalidAmount(self.amount));
        }
        Ok(())
    }
}

/// A persisted transfer. `id` is assigned by the store, `block_id` is the
/// index of the owning block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub block_id: u64,
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
}

impl Transaction {
    pub fn record(&self) -> TransferRecord {
        TransferRecord {
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            amount: self.amount,
        }
    }
}

/// One row of the atomic append unit: a transfer bound to the block it
/// belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTransaction {
    pub block_id: u64,
    pub record: TransferRecord,
}

/// A persisted block. Transactions live in their own table and are joined
/// back through `Transaction::block_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: f64,
    pub previous_hash: String,
    pub nonce: u64,
    pub hash: String,
    /// Leading zero hex digits required when this block was mined. Not hashed.
    pub difficulty: u32,
}

impl Block {
    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    /// The hashed fields of this block, given its transactions in insertion order.
    pub fn fields(&self, transactions: &[TransferRecord]) -> BlockFields {
        BlockFields {
            index: Some(self.index),
            timestamp: self.timestamp,
            transactions: transactions.to_vec(),
            previous_hash: self.previous_hash.clone(),
            nonce: self.nonce,
        }
    }

    pub fn recompute_hash(&self, transactions: &[TransferRecord]) -> String {
        self.fields(transactions).digest()
    }
}

/// The fields covered by a block digest.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockFields {
    pub index: Option<u64>,
    pub timestamp: f64,
    pub transactions: Vec<TransferRecord>,
    pub previous_hash: String,
    pub nonce: u64,
}

// Field order below is lexicographic and is what makes the encoding canonical.
#[derive(Serialize)]
struct CanonicalBlock<'a> {
    index: Option<u64>,
    nonce: u64,
    previous_hash: &'a str,
    timestamp: f64,
    transactions: Vec<CanonicalTransfer<'a>>,
}

#[derive(Serialize)]
struct CanonicalTail<'a> {
    previous_hash: &'a str,
    timestamp: f64,
    transactions: Vec<CanonicalTransfer<'a>>,
}

#[derive(Serialize)]
struct CanonicalTransfer<'a> {
    amount: f64,
    recipient: &'a str,
    sender: &'a str,
}

impl<'a> From<&'a TransferRecord> for CanonicalTransfer<'a> {
    fn from(tx: &'a TransferRecord) -> Self {
        Self {
            amount: tx.amount,
            recipient: &tx.recipient,
            sender: &tx.sender,
        }
    }
}

impl BlockFields {
    pub fn new(
        index: u64,
        previous_hash: impl Into<String>,
        transactions: Vec<TransferRecord>,
        timestamp: f64,
    ) -> Self {
        Self {
            index: Some(index),
            timestamp,
            transactions,
            previous_hash: previous_hash.into(),
            nonce: 0,
        }
    }

    /// Compact JSON with lexicographically ordered keys. Reals use the
    /// shortest representation that round-trips.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let canonical = CanonicalBlock {
            index: self.index,
            nonce: self.nonce,
            previous_hash: &self.previous_hash,
            timestamp: self.timestamp,
            transactions: self.transactions.iter().map(Into::into).collect(),
        };
        serde_json::to_vec(&canonical).expect("canonical block fields always serialize")
    }

    /// SHA-256 over the canonical bytes.
    pub fn digest_bytes(&self) -> Hash {
        sha256(&self.canonical_bytes())
    }

    /// Lowercase hex SHA-256 over the canonical bytes.
    pub fn digest(&self) -> String {
        hex::encode(self.digest_bytes())
    }

    /// Split encoding used by the miners: everything before the nonce is
    /// absorbed once, so each attempt only hashes the nonce and the tail.
    pub fn preimage(&self) -> Preimage {
        let index = serde_json::to_string(&self.index).expect("index always serializes");
        let tail = CanonicalTail {
            previous_hash: &self.previous_hash,
            timestamp: self.timestamp,
            transactions: self.transactions.iter().map(Into::into).collect(),
        };
        let tail = serde_json::to_vec(&tail).expect("canonical block fields always serialize");

        let mut head = Sha256::new();
        head.update(b"{\"index\":");
        head.update(index.as_bytes());
        head.update(b",\"nonce\":");

        // `tail` opens with its own `{`; replace it with the separator.
        let mut rest = Vec::with_capacity(tail.len());
        rest.push(b',');
        rest.extend_from_slice(&tail[1..]);
        Preimage { head, tail: rest }
    }
}

/// Hash state with the nonce-independent prefix already absorbed.
#[derive(Clone)]
pub struct Preimage {
    head: Sha256,
    tail: Vec<u8>,
}

impl Preimage {
    pub fn digest(&self, nonce: u64) -> Hash {
        let mut hasher = self.head.clone();
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(&self.tail);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..]);
        out
    }
}

pub fn sha256(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..]);
    out
}

/// Seconds since the Unix epoch with sub-second precision.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Result of a successful nonce search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mined {
    pub nonce: u64,
    pub hash: String,
}

pub mod pow {
    use super::{BlockFields, Hash, LedgerError, Mined, Result};
    use crate::constants::{CANCEL_CHECK_INTERVAL, MAX_DIFFICULTY};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Number of leading `'0'` characters in the hex rendering of `hash`.
    pub fn leading_zero_hex_digits(hash: &Hash) -> u32 {
        let mut total = 0u32;
        for b in hash {
            if *b == 0 {
                total += 2;
            } else {
                if *b < 0x10 {
                    total += 1;
                }
                break;
            }
        }
        total
    }

    pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
        let want = difficulty as usize;
        hash_hex.len() >= want && hash_hex.bytes().take(want).all(|c| c == b'0')
    }

    pub fn check_difficulty(difficulty: u32) -> Result<()> {
        if difficulty > MAX_DIFFICULTY {
            return Err(LedgerError::InvalidDifficulty(difficulty));
        }
        Ok(())
    }

    /// Search nonces upward from 0 and return the first whose digest has at
    /// least `difficulty` leading zero hex digits. The nonce in `fields` is ignored.
    pub fn mine(fields: &BlockFields, difficulty: u32) -> Result<Mined> {
        check_difficulty(difficulty)?;
        let preimage = fields.preimage();
        let mut nonce = 0u64;
        loop {
            let h = preimage.digest(nonce);
            if leading_zero_hex_digits(&h) >= difficulty {
                return Ok(Mined {
                    nonce,
                    hash: hex::encode(h),
                });
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Same search as [`mine`], polling `cancel` every
    /// `CANCEL_CHECK_INTERVAL` nonces.
    pub fn mine_cancellable(
        fields: &BlockFields,
        difficulty: u32,
        cancel: &AtomicBool,
    ) -> Result<Mined> {
        check_difficulty(difficulty)?;
        let preimage = fields.preimage();
        let mut nonce = 0u64;
        loop {
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return Err(LedgerError::MiningCancelled);
            }
            let h = preimage.digest(nonce);
            if leading_zero_hex_digits(&h) >= difficulty {
                return Ok(Mined {
                    nonce,
                    hash: hex::encode(h),
                });
            }
            nonce = nonce.wrapping_add(1);
        }
    }
}
