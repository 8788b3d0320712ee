use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out strictly increasing ids.
///
/// Group ids (branch keys, stack ids) are minted here and never handed out
/// twice, so a retired id can never come back with different membership.
#[derive(Debug)]
pub struct IdMint {
    next: AtomicU64,
}

impl IdMint {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Resumes minting after ids restored from storage.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next call to [`IdMint::next`] returns.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for IdMint {
    fn default() -> Self {
        Self::new()
    }
}
