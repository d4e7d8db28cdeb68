//! Write-back hook
//!
//! The pool does not schedule write-back itself. When the free slot search
//! keeps failing it asks the [`Flusher`] to make tail pages clean, and it
//! asks the flusher whether a block may be replaced at all.

use tracing::{debug, warn};

use crate::buf::block::BufBlock;
use crate::buf::pool::BufferPool;

/// Collaborator deciding replaceability and cleaning pages on demand
pub trait Flusher: Send + Sync {
    /// Whether the LRU scan may reclaim `block`
    fn is_replaceable(&self, block: &BufBlock) -> bool {
        block.is_replaceable()
    }

    /// Clean up to `hint` pages near the LRU tail. Called without pool locks.
    fn request_writeback(&self, pool: &BufferPool, hint: usize);
}

/// Writes dirty pages from the LRU tail through the pool's page store
#[derive(Debug, Default, Clone, Copy)]
pub struct LruTailFlusher;

impl Flusher for LruTailFlusher {
    fn request_writeback(&self, pool: &BufferPool, hint: usize) {
        match pool.flush_lru_tail(hint) {
            Ok(written) => debug!(written, hint, "LRU tail write-back"),
            Err(e) => warn!(error = %e, "LRU tail write-back failed"),
        }
    }
}

/// Never writes anything; dirty pages stay pinned in the pool
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlusher;

impl Flusher for NoopFlusher {
    fn request_writeback(&self, _pool: &BufferPool, _hint: usize) {}
}
