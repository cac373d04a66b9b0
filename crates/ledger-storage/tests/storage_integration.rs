mod helpers;

use helpers::{create_temp_store, teardown_store, transfer};
use ledger_core::{chain::LedgerStore, Block, LedgerError, NewTransaction};
use ledger_storage::SledStore;
use rand::Rng;
use std::sync::Arc;
use tempfile::tempdir;

fn block(index: u64, previous_hash: &str) -> Block {
    Block {
        index,
        timestamp: 1_700_000_000.0 + index as f64,
        previous_hash: previous_hash.to_string(),
        nonce: index * 3,
        hash: format!("{index:064x}"),
        difficulty: 0,
    }
}

#[test]
fn test_empty_store_has_no_head() -> anyhow::Result<()> {
    let (temp_dir, store) = create_temp_store();
    assert!(store.latest_block()?.is_none());
    assert!(store.all_blocks_ordered()?.is_empty());
    assert!(store.get_block(0)?.is_none());
    teardown_store(temp_dir, store);
    Ok(())
}

#[test]
fn test_blocks_come_back_ordered() -> anyhow::Result<()> {
    let (temp_dir, store) = create_temp_store();
    // Insert out of order, including indices past 255 so byte order matters.
    for index in [3u64, 0, 256, 1, 2] {
        store.insert_block(&block(index, "0"))?;
    }
    let indices: Vec<u64> = store.all_blocks_ordered()?.iter().map(|b| b.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 256]);
    assert_eq!(store.latest_block()?.map(|b| b.index), Some(256));
    assert_eq!(store.get_block(2)?, Some(block(2, "0")));
    teardown_store(temp_dir, store);
    Ok(())
}

#[test]
fn test_duplicate_block_index_rejected() -> anyhow::Result<()> {
    let (temp_dir, store) = create_temp_store();
    store.insert_block(&block(0, "0"))?;
    let mut other = block(0, "0");
    other.hash = "ff".repeat(32);
    let err = store.insert_block(&other).unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateKey(0)));
    // The first row is untouched.
    assert_eq!(store.get_block(0)?, Some(block(0, "0")));
    teardown_store(temp_dir, store);
    Ok(())
}

#[test]
fn test_transaction_requires_existing_block() -> anyhow::Result<()> {
    let (temp_dir, store) = create_temp_store();
    let err = store
        .insert_transaction(4, &transfer("alice", "bob", 1.0))
        .unwrap_err();
    assert!(matches!(err, LedgerError::ForeignKeyViolation(4)));
    assert!(store.transactions_by_sender("alice")?.is_empty());
    assert!(store.transactions_by_block(4)?.is_empty());
    teardown_store(temp_dir, store);
    Ok(())
}

#[test]
fn test_transaction_ids_and_sender_lookup() -> anyhow::Result<()> {
    let (temp_dir, store) = create_temp_store();
    store.insert_block(&block(0, "0"))?;
    store.insert_block(&block(1, "0"))?;

    let a = store.insert_transaction(0, &transfer("alice", "bob", 10.0))?;
    let b = store.insert_transaction(1, &transfer("al", "carol", 2.0))?;
    let c = store.insert_transaction(1, &transfer("alice", "dave", 3.5))?;
    let d = store.insert_transaction(1, &transfer("Alice", "erin", 4.0))?;

    assert!(a.id >= 1);
    assert!(a.id < b.id && b.id < c.id && c.id < d.id);

    let by_alice = store.transactions_by_sender("alice")?;
    assert_eq!(by_alice, vec![a.clone(), c.clone()]);
    assert_eq!(store.transactions_by_sender("al")?, vec![b.clone()]);
    assert_eq!(store.transactions_by_sender("Alice")?, vec![d.clone()]);
    assert!(store.transactions_by_sender("ali")?.is_empty());

    assert_eq!(store.transactions_by_block(1)?, vec![b, c, d]);
    assert_eq!(store.transactions_by_block(0)?, vec![a]);
    teardown_store(temp_dir, store);
    Ok(())
}

#[test]
fn test_append_block_is_atomic() -> anyhow::Result<()> {
    let (temp_dir, store) = create_temp_store();
    store.insert_block(&block(0, "0"))?;

    // Second row points at a block that does not exist: the whole unit must roll back.
    let rows = vec![
        NewTransaction {
            block_id: 1,
            record: transfer("alice", "bob", 1.0),
        },
        NewTransaction {
            block_id: 77,
            record: transfer("bob", "carol", 2.0),
        },
    ];
    let err = store.append_block(&block(1, "0"), &rows).unwrap_err();
    assert!(matches!(err, LedgerError::ForeignKeyViolation(77)));
    assert!(store.get_block(1)?.is_none());
    assert_eq!(store.latest_block()?.map(|b| b.index), Some(0));
    assert!(store.transactions_by_sender("alice")?.is_empty());
    assert!(store.transactions_by_block(1)?.is_empty());

    // The same block goes through once the rows are consistent.
    let rows: Vec<NewTransaction> = rows
        .into_iter()
        .map(|row| NewTransaction { block_id: 1, ..row })
        .collect();
    let stored = store.append_block(&block(1, "0"), &rows)?;
    assert_eq!(stored.len(), 2);
    assert_eq!(store.transactions_by_block(1)?, stored);
    teardown_store(temp_dir, store);
    Ok(())
}

#[test]
fn test_non_finite_amounts_rejected() -> anyhow::Result<()> {
    let (temp_dir, store) = create_temp_store();
    store.insert_block(&block(0, "0"))?;

    for amount in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = store
            .insert_transaction(0, &transfer("alice", "bob", amount))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        let rows = vec![
            NewTransaction {
                block_id: 1,
                record: transfer("alice", "bob", 1.0),
            },
            NewTransaction {
                block_id: 1,
                record: transfer("alice", "bob", amount),
            },
        ];
        let err = store.append_block(&block(1, "0"), &rows).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
    }
    assert!(store.get_block(1)?.is_none());
    assert!(store.transactions_by_sender("alice")?.is_empty());
    teardown_store(temp_dir, store);
    Ok(())
}

#[test]
fn test_append_duplicate_block_rolls_back() -> anyhow::Result<()> {
    let (temp_dir, store) = create_temp_store();
    store.insert_block(&block(0, "0"))?;
    let rows = vec![NewTransaction {
        block_id: 0,
        record: transfer("mallory", "mallory", 100.0),
    }];
    let err = store.append_block(&block(0, "0"), &rows).unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateKey(0)));
    assert!(store.transactions_by_sender("mallory")?.is_empty());
    teardown_store(temp_dir, store);
    Ok(())
}

#[test]
fn test_storage_persistence() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("blockchain.db");
    let mut rng = rand::thread_rng();
    let amount: f64 = rng.gen_range(0.0..1_000.0);
    let genesis = block(0, "0");
    {
        let store = SledStore::open(&db_path)?;
        store.append_block(
            &genesis,
            &[NewTransaction {
                block_id: 0,
                record: transfer("alice", "bob", amount),
            }],
        )?;
        store.close()?;
    }
    // Re-open and verify the rows persist bit for bit
    {
        let store = SledStore::open(&db_path)?;
        assert_eq!(store.latest_block()?, Some(genesis));
        let txs = store.transactions_by_sender("alice")?;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount.to_bits(), amount.to_bits());

        // Ids keep increasing across restarts.
        let next = store.insert_transaction(0, &transfer("alice", "carol", 1.0))?;
        assert!(next.id > txs[0].id);
    }
    temp_dir.close()?;
    Ok(())
}

#[tokio::test]
async fn test_storage_concurrent_transactions() -> anyhow::Result<()> {
    let (temp_dir, store) = create_temp_store();
    store.insert_block(&block(0, "0"))?;
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = Arc::clone(&store);
        handles.push(tokio::task::spawn_blocking(move || {
            store
                .insert_transaction(0, &transfer("shared", &format!("r{i}"), i as f64))
                .unwrap()
                .id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await?);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    assert_eq!(store.transactions_by_sender("shared")?.len(), 20);

    let store = Arc::try_unwrap(store).unwrap_or_else(|_| panic!("store still shared"));
    teardown_store(temp_dir, store);
    Ok(())
}

#[test]
fn test_storage_trait_compliance() {
    fn assert_ledger_store<T: LedgerStore>() {}
    assert_ledger_store::<SledStore>();
}
