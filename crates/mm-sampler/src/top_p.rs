use crate::sampler::{Sampler, TokenLogit};

/// Nucleus sampling: keeps the smallest set of tokens whose cumulative
/// probability exceeds the threshold `p`.
pub struct TopPSampler {
    p: f32,
}

impl TopPSampler {
    /// Create a new top-p (nucleus) sampler with the given probability threshold.
    /// `p >= 1.0` disables the stage.
    pub fn new(p: f32) -> Self {
        Self { p }
    }
}

impl Sampler for TopPSampler {
    fn name(&self) -> &str {
        "top_p"
    }

    fn apply(&mut self, candidates: &mut Vec<TokenLogit>) {
        if candidates.is_empty() || self.p >= 1.0 {
            return;
        }

        candidates.sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));

        let max_logit = candidates[0].logit;
        let exps: Vec<f32> = candidates.iter().map(|t| (t.logit - max_logit).exp()).collect();
        let sum: f32 = exps.iter().sum();

        let mut cumulative = 0.0f32;
        let mut cutoff = candidates.len();
        for (i, e) in exps.iter().enumerate() {
            cumulative += e / sum;
            if cumulative > self.p {
                cutoff = i + 1;
                break;
            }
        }

        candidates.truncate(cutoff.max(1));
    }
}
