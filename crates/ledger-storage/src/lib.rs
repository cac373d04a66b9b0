//! Durable ledger tables on sled.
//!
//! Layout mirrors a relational schema with four trees:
//!
//! - `blocks`: big-endian block index -> bincode `Block`
//! - `transactions`: big-endian transaction id -> bincode `Transaction`
//! - `transactions_by_block`: block index ++ transaction id -> ()
//! - `transactions_by_sender`: sender length ++ sender ++ transaction id -> ()
//!
//! Big-endian keys make sled's byte ordering match numeric ordering, so
//! range scans come back ascending by index or id.

pub mod sled_store;

pub use sled_store::SledStore;
