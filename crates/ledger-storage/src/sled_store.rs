use ledger_core::{
  chain::LedgerStore, Block, LedgerError, NewTransaction, Result, Transaction, TransferRecord,
};
use serde::de::DeserializeOwned;
use sled::{
  transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
  },
  Db, IVec, Transactional, Tree,
};
use std::path::Path;
use tracing::{debug, info, warn};

const TREE_BLOCKS: &str = "blocks";
const TREE_TRANSACTIONS: &str = "transactions";
const TREE_TX_BY_BLOCK: &str = "transactions_by_block";
const TREE_TX_BY_SENDER: &str = "transactions_by_sender";

#[derive(Clone)]
pub struct SledStore {
  db: Db,
  blocks: Tree,
  transactions: Tree,
  by_block: Tree,
  by_sender: Tree,
}

fn unavailable(e: sled::Error) -> LedgerError {
  LedgerError::StorageUnavailable(e.to_string())
}

fn codec(e: bincode::Error) -> LedgerError {
  LedgerError::Codec(e.to_string())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
  bincode::deserialize(bytes).map_err(codec)
}

fn id_from(bytes: &[u8]) -> u64 {
  let mut arr = [0u8; 8];
  arr.copy_from_slice(&bytes[bytes.len() - 8..]);
  u64::from_be_bytes(arr)
}

fn block_key(block_id: u64, tx_id: u64) -> Vec<u8> {
  let mut key = Vec::with_capacity(16);
  key.extend_from_slice(&block_id.to_be_bytes());
  key.extend_from_slice(&tx_id.to_be_bytes());
  key
}

// Length prefix so "al" never scans into "alice".
fn sender_prefix(sender: &str) -> Vec<u8> {
  let mut key = Vec::with_capacity(4 + sender.len() + 8);
  key.extend_from_slice(&(sender.len() as u32).to_be_bytes());
  key.extend_from_slice(sender.as_bytes());
  key
}

fn sender_key(sender: &str, tx_id: u64) -> Vec<u8> {
  let mut key = sender_prefix(sender);
  key.extend_from_slice(&tx_id.to_be_bytes());
  key
}

fn unwrap_tx_result<T>(result: std::result::Result<T, TransactionError<LedgerError>>) -> Result<T> {
  result.map_err(|e| match e {
    TransactionError::Abort(e) => e,
    TransactionError::Storage(e) => unavailable(e),
  })
}

/// Write one transaction row and its index entries. Aborts with
/// `ForeignKeyViolation` unless `blocks` (as seen inside this storage
/// transaction) holds the referenced block.
fn stage_transaction(
  blocks: &TransactionalTree,
  transactions: &TransactionalTree,
  by_block: &TransactionalTree,
  by_sender: &TransactionalTree,
  tx: &Transaction,
) -> ConflictableTransactionResult<(), LedgerError> {
  if blocks.get(&tx.block_id.to_be_bytes()[..])?.is_none() {
    return abort(LedgerError::ForeignKeyViolation(tx.block_id));
  }
  let bytes =
    bincode::serialize(tx).map_err(|e| ConflictableTransactionError::Abort(codec(e)))?;
  transactions.insert(&tx.id.to_be_bytes()[..], bytes)?;
  by_block.insert(block_key(tx.block_id, tx.id), &b""[..])?;
  by_sender.insert(sender_key(&tx.sender, tx.id), &b""[..])?;
  Ok(())
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let db = sled::open(path).map_err(unavailable)?;
    let store = Self {
      blocks: db.open_tree(TREE_BLOCKS).map_err(unavailable)?,
      transactions: db.open_tree(TREE_TRANSACTIONS).map_err(unavailable)?,
      by_block: db.open_tree(TREE_TX_BY_BLOCK).map_err(unavailable)?,
      by_sender: db.open_tree(TREE_TX_BY_SENDER).map_err(unavailable)?,
      db,
    };
    info!("sled store opened");
    Ok(store)
  }

  /// Drop every block and transaction. Test and tooling use only.
  pub fn clear(&self) -> Result<()> {
    for tree in [&self.blocks, &self.transactions, &self.by_block, &self.by_sender] {
      tree.clear().map_err(unavailable)?;
    }
    self.flush()
  }

  fn flush(&self) -> Result<()> {
    self.db.flush().map_err(unavailable)?;
    Ok(())
  }

  // Ids start at 1 and are never handed out twice, even when the storage
  // transaction that took one aborts.
  fn next_transaction_id(&self) -> Result<u64> {
    Ok(self.db.generate_id().map_err(unavailable)? + 1)
  }

  fn new_row(&self, block_id: u64, record: &TransferRecord) -> Result<Transaction> {
    record.check_amount()?;
    Ok(Transaction {
      id: self.next_transaction_id()?,
      block_id,
      sender: record.sender.clone(),
      recipient: record.recipient.clone(),
      amount: record.amount,
    })
  }

  fn load_transaction(&self, id: u64) -> Result<Transaction> {
    match self.transactions.get(id.to_be_bytes()).map_err(unavailable)? {
      Some(bytes) => decode(&bytes),
      None => Err(LedgerError::Codec(format!(
        "index references missing transaction {id}"
      ))),
    }
  }

  fn load_indexed(&self, index: &Tree, prefix: Vec<u8>) -> Result<Vec<Transaction>> {
    index
      .scan_prefix(prefix)
      .keys()
      .map(|key| {
        let key: IVec = key.map_err(unavailable)?;
        self.load_transaction(id_from(&key))
      })
      .collect()
  }
}

impl LedgerStore for SledStore {
  fn insert_block(&self, block: &Block) -> Result<()> {
    let key = block.index.to_be_bytes();
    let bytes = bincode::serialize(block).map_err(codec)?;
    let swapped = self
      .blocks
      .compare_and_swap(key, None as Option<&[u8]>, Some(bytes))
      .map_err(unavailable)?;
    if swapped.is_err() {
      return Err(LedgerError::DuplicateKey(block.index));
    }
    self.flush()?;
    debug!(index = block.index, "block stored");
    Ok(())
  }

  fn insert_transaction(&self, block_id: u64, record: &TransferRecord) -> Result<Transaction> {
    let tx = self.new_row(block_id, record)?;
    let result = (&self.blocks, &self.transactions, &self.by_block, &self.by_sender).transaction(
      |(blocks, transactions, by_block, by_sender)| {
        stage_transaction(blocks, transactions, by_block, by_sender, &tx)
      },
    );
    unwrap_tx_result(result)?;
    self.flush()?;
    debug!(id = tx.id, block_id, "transaction stored");
    Ok(tx)
  }

  fn append_block(
    &self,
    block: &Block,
    transactions: &[NewTransaction],
  ) -> Result<Vec<Transaction>> {
    let bytes = bincode::serialize(block).map_err(codec)?;
    // Validate every row before any id is taken.
    for row in transactions {
      row.record.check_amount()?;
    }
    let rows = transactions
      .iter()
      .map(|row| self.new_row(row.block_id, &row.record))
      .collect::<Result<Vec<_>>>()?;

    let result = (&self.blocks, &self.transactions, &self.by_block, &self.by_sender).transaction(
      |(blocks, txs, by_block, by_sender)| {
        let key = block.index.to_be_bytes();
        if blocks.get(&key[..])?.is_some() {
          return abort(LedgerError::DuplicateKey(block.index));
        }
        blocks.insert(&key[..], bytes.as_slice())?;
        for tx in &rows {
          stage_transaction(blocks, txs, by_block, by_sender, tx)?;
        }
        Ok(())
      },
    );
    if let Err(e) = unwrap_tx_result(result) {
      warn!(index = block.index, error = %e, "block append rolled back");
      return Err(e);
    }

    self.flush()?;
    debug!(index = block.index, transactions = rows.len(), "block appended");
    Ok(rows)
  }

  fn get_block(&self, index: u64) -> Result<Option<Block>> {
    self
      .blocks
      .get(index.to_be_bytes())
      .map_err(unavailable)?
      .map(|ivec| decode(&ivec))
      .transpose()
  }

  fn latest_block(&self) -> Result<Option<Block>> {
    self
      .blocks
      .last()
      .map_err(unavailable)?
      .map(|(_, ivec)| decode(&ivec))
      .transpose()
  }

  fn transactions_by_sender(&self, sender: &str) -> Result<Vec<Transaction>> {
    self.load_indexed(&self.by_sender, sender_prefix(sender))
  }

  fn transactions_by_block(&self, block_id: u64) -> Result<Vec<Transaction>> {
    self.load_indexed(&self.by_block, block_id.to_be_bytes().to_vec())
  }

  fn all_blocks_ordered(&self) -> Result<Vec<Block>> {
    self
      .blocks
      .iter()
      .values()
      .map(|ivec| decode(&ivec.map_err(unavailable)?))
      .collect()
  }

  fn close(&self) -> Result<()> {
    self.flush()?;
    info!("sled store closed");
    Ok(())
  }
}
