use crate::sampler::{Sampler, TokenLogit};

/// Keeps only the top K tokens by logit value, discarding the rest.
pub struct TopKSampler {
    k: usize,
}

impl TopKSampler {
    /// Create a new top-K sampler that retains the `k` highest-logit tokens.
    /// `k == 0` disables the stage.
    pub fn new(k: usize) -> Self {
        Self { k }
    }
}

impl Sampler for TopKSampler {
    fn name(&self) -> &str {
        "top_k"
    }

    fn apply(&mut self, candidates: &mut Vec<TokenLogit>) {
        if self.k == 0 || self.k >= candidates.len() {
            return;
        }

        // Stable sort: equal logits keep ascending id order.
        candidates.sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.k);
    }
}
