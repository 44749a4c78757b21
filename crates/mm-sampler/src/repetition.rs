use std::collections::VecDeque;

use crate::sampler::{Sampler, TokenLogit};

/// Applies a repetition penalty to tokens that have appeared recently.
///
/// For tokens found in the recent history:
/// - Positive logits are divided by `penalty`.
/// - Negative logits are multiplied by `penalty`.
///
/// History is fed through `accept`, so the chain keeps it current.
pub struct RepetitionPenaltySampler {
    penalty: f32,
    recent_tokens: VecDeque<u32>,
    max_history: usize,
}

impl RepetitionPenaltySampler {
    /// Create a new repetition penalty sampler.
    ///
    /// - `penalty`: the penalty factor (1.0 = no penalty).
    /// - `max_history`: maximum number of recent tokens to track.
    pub fn new(penalty: f32, max_history: usize) -> Self {
        Self {
            penalty,
            recent_tokens: VecDeque::with_capacity(max_history),
            max_history,
        }
    }

    /// Number of tokens currently remembered.
    pub fn history_len(&self) -> usize {
        self.recent_tokens.len()
    }
}

impl Sampler for RepetitionPenaltySampler {
    fn name(&self) -> &str {
        "repetition_penalty"
    }

    fn apply(&mut self, candidates: &mut Vec<TokenLogit>) {
        if self.penalty == 1.0 || self.recent_tokens.is_empty() {
            return;
        }
        for token in candidates.iter_mut() {
            if self.recent_tokens.contains(&token.token_id) {
                if token.logit > 0.0 {
                    token.logit /= self.penalty;
                } else {
                    token.logit *= self.penalty;
                }
            }
        }
    }

    fn accept(&mut self, token_id: u32) {
        if self.max_history == 0 {
            return;
        }
        if self.recent_tokens.len() == self.max_history {
            self.recent_tokens.pop_front();
        }
        self.recent_tokens.push_back(token_id);
    }

    fn reset(&mut self) {
        self.recent_tokens.clear();
    }
}
