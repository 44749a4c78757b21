use crate::sampler::{Sampler, TokenLogit};
use rand::rngs::StdRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;

/// Greedy sampler: selects the single token with the highest logit.
///
/// Ties go to the lowest token id, so identical logits always yield the
/// identical token regardless of the order earlier stages left candidates in.
/// NaN logits never win against a real number.
pub struct GreedySampler;

impl GreedySampler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GreedySampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the argmax candidate, lowest token id on ties.
fn argmax(candidates: &[TokenLogit]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, cand) in candidates.iter().enumerate() {
        best = match best {
            None => Some(i),
            Some(b) => {
                let cur = &candidates[b];
                let better = if cur.logit.is_nan() {
                    !cand.logit.is_nan() || cand.token_id < cur.token_id
                } else {
                    cand.logit > cur.logit
                        || (cand.logit == cur.logit && cand.token_id < cur.token_id)
                };
                if better {
                    Some(i)
                } else {
                    Some(b)
                }
            }
        };
    }
    best
}

fn keep_only(candidates: &mut Vec<TokenLogit>, index: usize) {
    let selected = candidates.swap_remove(index);
    candidates.clear();
    candidates.push(selected);
}

impl Sampler for GreedySampler {
    fn name(&self) -> &str {
        "greedy"
    }

    fn apply(&mut self, candidates: &mut Vec<TokenLogit>) {
        if let Some(i) = argmax(candidates) {
            keep_only(candidates, i);
        }
    }
}

/// Distribution-based sampler: converts logits to probabilities via softmax,
/// then draws from the resulting distribution.
///
/// The RNG advances on every draw and is reseeded on `reset`, so a session
/// replayed from reset with the same seed reproduces the same tokens.
pub struct DistSampler {
    seed: u64,
    rng: StdRng,
}

impl DistSampler {
    /// Create a new distribution sampler with the given seed for reproducibility.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Sampler for DistSampler {
    fn name(&self) -> &str {
        "dist"
    }

    fn apply(&mut self, candidates: &mut Vec<TokenLogit>) {
        if candidates.is_empty() {
            return;
        }

        let max_logit = candidates
            .iter()
            .map(|t| t.logit)
            .fold(f32::NEG_INFINITY, f32::max);

        let weights: Vec<f32> = candidates
            .iter()
            .map(|t| (t.logit - max_logit).exp())
            .collect();

        match WeightedIndex::new(&weights) {
            Ok(dist) => {
                let i = dist.sample(&mut self.rng);
                keep_only(candidates, i);
            }
            // Degenerate weights (all -inf or NaN): fall back to argmax.
            Err(_) => {
                if let Some(i) = argmax(candidates) {
                    keep_only(candidates, i);
                }
            }
        }
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }
}
