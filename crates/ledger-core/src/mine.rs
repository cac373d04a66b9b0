use crate::{
    constants::PARALLEL_WINDOW,
    pow::{check_difficulty, leading_zero_hex_digits},
    BlockFields, LedgerError, Mined, Result,
};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Smallest nonce accepted by `accept`, searched window by window so the
/// whole pool works on the low end of the nonce space. Returns `None` if
/// `cancel` is raised between windows or the space runs out.
pub(crate) fn first_match<P>(accept: P, cancel: &AtomicBool) -> Option<u64>
where
    P: Fn(u64) -> bool + Sync,
{
    let mut base = 0u64;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        let end = base.saturating_add(PARALLEL_WINDOW);
        if let Some(found) = (base..end).into_par_iter().find_first(|n| accept(*n)) {
            return Some(found);
        }
        if end == u64::MAX {
            return None;
        }
        base = end;
    }
}

/// Searches nonces in parallel. First-match semantics keep the result equal
/// to the sequential search: the smallest satisfying nonce wins, whichever
/// thread finds it.
pub fn mine_parallel(fields: &BlockFields, difficulty: u32) -> Result<Mined> {
    mine_parallel_cancellable(fields, difficulty, &AtomicBool::new(false))
}

/// As [`mine_parallel`], checking `cancel` after every window.
pub fn mine_parallel_cancellable(
    fields: &BlockFields,
    difficulty: u32,
    cancel: &AtomicBool,
) -> Result<Mined> {
    check_difficulty(difficulty)?;
    let preimage = fields.preimage();

    let found = first_match(
        |nonce| leading_zero_hex_digits(&preimage.digest(nonce)) >= difficulty,
        cancel,
    )
    .ok_or(LedgerError::MiningCancelled)?;

    let hash = hex::encode(preimage.digest(found));
    debug!(nonce = found, %hash, "parallel search finished");
    Ok(Mined { nonce: found, hash })
}
