use std::collections::HashMap;

use mm_model::SeqId;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Per-sequence count of filled KV positions.
///
/// `n_past(seq)` is both the number of cached positions for `seq` and the
/// position the next forward pass writes to. Every advance is checked
/// against the context capacity first; a rejected advance leaves the
/// cursor where it was.
#[derive(Debug, Clone)]
pub struct KvCacheManager {
    n_ctx: usize,
    n_past: HashMap<SeqId, usize>,
}

impl KvCacheManager {
    pub fn new(n_ctx: usize) -> Self {
        KvCacheManager {
            n_ctx,
            n_past: HashMap::new(),
        }
    }

    /// Context capacity in positions.
    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn n_past(&self, seq_id: SeqId) -> usize {
        self.n_past.get(&seq_id).copied().unwrap_or(0)
    }

    /// Free positions left for `seq_id`.
    pub fn remaining(&self, seq_id: SeqId) -> usize {
        self.n_ctx.saturating_sub(self.n_past(seq_id))
    }

    /// Fail with `CapacityExceeded` if `n_slots` more positions do not fit.
    pub fn capacity_check(&self, seq_id: SeqId, n_slots: usize) -> Result<()> {
        let n_past = self.n_past(seq_id);
        if n_past + n_slots > self.n_ctx {
            return Err(EngineError::CapacityExceeded {
                seq_id,
                n_past,
                n_slots,
                n_ctx: self.n_ctx,
            });
        }
        Ok(())
    }

    /// Record `n_slots` consumed positions. Returns the new `n_past`.
    pub fn advance(&mut self, seq_id: SeqId, n_slots: usize) -> Result<usize> {
        self.capacity_check(seq_id, n_slots)?;
        let n_past = self.n_past.entry(seq_id).or_insert(0);
        *n_past += n_slots;
        Ok(*n_past)
    }

    /// Reset `seq_id` to zero and have `drop_entries` remove its cached
    /// entries. Idempotent.
    pub fn clear(&mut self, seq_id: SeqId, drop_entries: impl FnOnce(SeqId)) {
        let was = self.n_past.remove(&seq_id).unwrap_or(0);
        drop_entries(seq_id);
        debug!(seq_id, n_past = was, "cleared KV sequence");
    }
}
