pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;
/// Sentinel `previous_hash` carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";
pub const DEFAULT_DIFFICULTY: u32 = 2;
/// One leading zero per hex digit, so the digest width bounds the difficulty.
pub const MAX_DIFFICULTY: u32 = HASH_HEX_SIZE as u32;
/// Nonces tried between polls of a cancellation flag.
pub const CANCEL_CHECK_INTERVAL: u64 = 4096;
pub const DEFAULT_DB_PATH: &str = "blockchain.db";
/// Nonces handed to the rayon pool per round of a parallel search.
pub const PARALLEL_WINDOW: u64 = 1 << 16;
