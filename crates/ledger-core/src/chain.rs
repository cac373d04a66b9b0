use crate::{
    constants::GENESIS_PREVIOUS_HASH,
    mine::{mine_parallel, mine_parallel_cancellable},
    pow::{self, meets_difficulty},
    unix_timestamp, Block, BlockFields, Mined, NewTransaction, Result, Transaction,
    TransferRecord,
};
use chrono::{DateTime, Local};
use std::{
    io::Write,
    sync::{atomic::AtomicBool, Arc, Mutex},
};
use thiserror::Error;
use tracing::{info, warn};

/// Persistence contract the chain engine runs on. Lives here so storage
/// backends can depend on `ledger-core` without a cycle.
///
/// Every write must be durable before it returns.
pub trait LedgerStore: Send + Sync {
    /// Fails with `DuplicateKey` if `block.index` is taken.
    fn insert_block(&self, block: &Block) -> Result<()>;

    /// Fails with `ForeignKeyViolation` if `block_id` is not persisted.
    fn insert_transaction(&self, block_id: u64, record: &TransferRecord) -> Result<Transaction>;

    /// Insert `block` and then every entry of `transactions` as one unit.
    /// If any insert fails nothing is persisted.
    fn append_block(&self, block: &Block, transactions: &[NewTransaction])
        -> Result<Vec<Transaction>>;

    fn get_block(&self, index: u64) -> Result<Option<Block>>;

    /// The block with the highest index.
    fn latest_block(&self) -> Result<Option<Block>>;

    /// Exact, case-sensitive match on `sender`, in insertion order.
    fn transactions_by_sender(&self, sender: &str) -> Result<Vec<Transaction>>;

    /// Transactions of one block in insertion order.
    fn transactions_by_block(&self, block_id: u64) -> Result<Vec<Transaction>>;

    /// Every block, ascending by index.
    fn all_blocks_ordered(&self) -> Result<Vec<Block>>;

    fn close(&self) -> Result<()>;
}

/// A block joined with its transactions.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainEntry {
    pub block: Block,
    pub transactions: Vec<Transaction>,
}

impl ChainEntry {
    pub fn records(&self) -> Vec<TransferRecord> {
        self.transactions.iter().map(Transaction::record).collect()
    }
}

/// An inconsistency found by [`Chain::verify`].
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ChainFault {
    #[error("expected block {expected}, found block {found}")]
    IndexGap { expected: u64, found: u64 },

    #[error("genesis previous hash is {found:?}, expected \"0\"")]
    GenesisLinkage { found: String },

    #[error("block {index} links to {found}, previous block hash is {expected}")]
    BrokenLink {
        index: u64,
        expected: String,
        found: String,
    },

    #[error("block {index} stores hash {stored}, fields hash to {computed}")]
    HashMismatch {
        index: u64,
        stored: String,
        computed: String,
    },

    #[error("block {index} hash does not meet difficulty {difficulty}")]
    InsufficientWork { index: u64, difficulty: u32 },
}

/// Chain engine over an explicit store handle.
///
/// Block additions read the head, mine, then write the new head; the
/// `writer` lock keeps those three steps from interleaving across clones.
pub struct Chain<S: LedgerStore> {
    store: Arc<S>,
    writer: Arc<Mutex<()>>,
}

impl<S: LedgerStore> Clone for Chain<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<S: LedgerStore> Chain<S> {
    /// Wrap `store` and make sure it holds a genesis block.
    pub fn open(store: Arc<S>) -> Result<Self> {
        let chain = Self {
            store,
            writer: Arc::new(Mutex::new(())),
        };
        chain.ensure_genesis()?;
        Ok(chain)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persist the genesis block if the store is empty. Idempotent; returns
    /// the block only when it was created by this call.
    pub fn ensure_genesis(&self) -> Result<Option<Block>> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if self.store.latest_block()?.is_some() {
            return Ok(None);
        }
        self.insert_genesis().map(Some)
    }

    // Caller holds the writer lock.
    fn insert_genesis(&self) -> Result<Block> {
        let genesis = genesis_block(unix_timestamp());
        self.store.insert_block(&genesis)?;
        info!(hash = %genesis.hash, "Genesis block created");
        Ok(genesis)
    }

    /// Mine and persist a block holding `records`, linked to the current head.
    pub fn add_block(&self, records: Vec<TransferRecord>, difficulty: u32) -> Result<Block> {
        self.add_block_with(records, difficulty, |fields| pow::mine(fields, difficulty))
    }

    /// As [`Chain::add_block`], but gives up with `MiningCancelled` once
    /// `cancel` is set. Nothing is persisted in that case.
    pub fn add_block_cancellable(
        &self,
        records: Vec<TransferRecord>,
        difficulty: u32,
        cancel: &AtomicBool,
    ) -> Result<Block> {
        self.add_block_with(records, difficulty, |fields| {
            pow::mine_cancellable(fields, difficulty, cancel)
        })
    }

    /// As [`Chain::add_block`], searching nonces on the rayon pool.
    pub fn add_block_parallel(
        &self,
        records: Vec<TransferRecord>,
        difficulty: u32,
    ) -> Result<Block> {
        self.add_block_with(records, difficulty, |fields| {
            mine_parallel(fields, difficulty)
        })
    }

    /// Parallel search that stops with `MiningCancelled` once `cancel` is set.
    pub fn add_block_parallel_cancellable(
        &self,
        records: Vec<TransferRecord>,
        difficulty: u32,
        cancel: &AtomicBool,
    ) -> Result<Block> {
        self.add_block_with(records, difficulty, |fields| {
            mine_parallel_cancellable(fields, difficulty, cancel)
        })
    }

    fn add_block_with<F>(
        &self,
        records: Vec<TransferRecord>,
        difficulty: u32,
        search: F,
    ) -> Result<Block>
    where
        F: FnOnce(&BlockFields) -> Result<Mined>,
    {
        pow::check_difficulty(difficulty)?;
        for record in &records {
            record.check_amount()?;
        }
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let head = match self.store.latest_block()? {
            Some(head) => head,
            None => self.insert_genesis()?,
        };
        let index = head.index + 1;
        let fields = BlockFields::new(index, head.hash, records, unix_timestamp());

        info!(index, difficulty, "Mining block {index}...");
        let mined = match search(&fields) {
            Ok(mined) => mined,
            Err(e) => {
                warn!(index, error = %e, "mining aborted");
                return Err(e);
            }
        };

        let block = Block {
            index,
            timestamp: fields.timestamp,
            previous_hash: fields.previous_hash,
            nonce: mined.nonce,
            hash: mined.hash,
            difficulty,
        };
        let rows: Vec<NewTransaction> = fields
            .transactions
            .into_iter()
            .map(|record| NewTransaction {
                block_id: index,
                record,
            })
            .collect();

        self.store.append_block(&block, &rows)?;
        info!(index, nonce = block.nonce, hash = %block.hash, "Block {index} mined");
        Ok(block)
    }

    pub fn get_latest_block(&self) -> Result<Option<Block>> {
        self.store.latest_block()
    }

    pub fn get_transactions_by_sender(&self, sender: &str) -> Result<Vec<Transaction>> {
        self.store.transactions_by_sender(sender)
    }

    /// Every block with its transactions, ascending by index.
    pub fn dump(&self) -> Result<Vec<ChainEntry>> {
        self.store
            .all_blocks_ordered()?
            .into_iter()
            .map(|block| {
                let transactions = self.store.transactions_by_block(block.index)?;
                Ok(ChainEntry {
                    block,
                    transactions,
                })
            })
            .collect()
    }

    /// Human-readable dump of the chain. Hashes are printed as stored, not
    /// re-verified.
    pub fn print_chain<W: Write>(&self, out: &mut W) -> Result<()> {
        for entry in self.dump()? {
            write_entry(out, &entry)?;
        }
        Ok(())
    }

    /// Walk the persisted chain and report every inconsistency found.
    pub fn verify(&self) -> Result<Vec<ChainFault>> {
        let mut faults = Vec::new();
        let mut previous: Option<Block> = None;

        for (expected, entry) in (0u64..).zip(self.dump()?) {
            let block = &entry.block;
            if block.index != expected {
                faults.push(ChainFault::IndexGap {
                    expected,
                    found: block.index,
                });
            }

            match &previous {
                None => {
                    if block.previous_hash != GENESIS_PREVIOUS_HASH {
                        faults.push(ChainFault::GenesisLinkage {
                            found: block.previous_hash.clone(),
                        });
                    }
                }
                Some(prev) if prev.hash != block.previous_hash => {
                    faults.push(ChainFault::BrokenLink {
                        index: block.index,
                        expected: prev.hash.clone(),
                        found: block.previous_hash.clone(),
                    });
                }
                Some(_) => {}
            }

            let computed = block.recompute_hash(&entry.records());
            if computed != block.hash {
                faults.push(ChainFault::HashMismatch {
                    index: block.index,
                    stored: block.hash.clone(),
                    computed,
                });
            }
            if !meets_difficulty(&block.hash, block.difficulty) {
                faults.push(ChainFault::InsufficientWork {
                    index: block.index,
                    difficulty: block.difficulty,
                });
            }

            previous = Some(entry.block);
        }
        Ok(faults)
    }

    /// Flush the store. The chain should not be used afterwards.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

/// Index 0, sentinel previous hash, nonce 0, no transactions.
pub fn genesis_block(timestamp: f64) -> Block {
    let fields = BlockFields::new(0, GENESIS_PREVIOUS_HASH, vec![], timestamp);
    Block {
        index: 0,
        timestamp,
        previous_hash: fields.previous_hash.clone(),
        nonce: 0,
        hash: fields.digest(),
        difficulty: 0,
    }
}

fn ctime(timestamp: f64) -> String {
    let secs = timestamp.floor() as i64;
    let nanos = ((timestamp - timestamp.floor()) * 1e9) as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%a %b %e %H:%M:%S %Y")
            .to_string(),
        None => timestamp.to_string(),
    }
}

pub(crate) fn write_entry<W: Write>(out: &mut W, entry: &ChainEntry) -> std::io::Result<()> {
    let block = &entry.block;
    writeln!(out)?;
    writeln!(out, "Block ID: {}, Hash: {}", block.index, block.hash)?;
    writeln!(
        out,
        "Previous Hash: {}, Nonce: {}, Timestamp: {}",
        block.previous_hash,
        block.nonce,
        ctime(block.timestamp)
    )?;
    if entry.transactions.is_empty() {
        writeln!(out, " No transactions")?;
    } else {
        writeln!(out, " Transactions:")?;
        for tx in &entry.transactions {
            writeln!(
                out,
                "  - Sender: {}, Recipient: {}, Amount: {:?}",
                tx.sender, tx.recipient, tx.amount
            )?;
        }
    }
    Ok(())
}
