use crate::error::{Result, SamplerError};

/// A candidate token paired with its (possibly rescaled) logit.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLogit {
    pub token_id: u32,
    pub logit: f32,
}

/// One stage of a sampling pipeline.
///
/// A stage narrows or reweights the candidate list in place. Selector stages
/// (greedy, dist) leave exactly one candidate behind.
pub trait Sampler: Send {
    /// Returns the name of this stage.
    fn name(&self) -> &str;

    /// Filter, rescale or select among `candidates` in place.
    fn apply(&mut self, candidates: &mut Vec<TokenLogit>);

    /// Observe the token that was finally chosen. Default does nothing.
    fn accept(&mut self, _token_id: u32) {}

    /// Drop any per-session state (history, RNG position). Default does nothing.
    fn reset(&mut self) {}
}

/// Ordered pipeline of sampling stages.
///
/// Stages run in registration order over the full vocabulary; the chain is
/// resolved only when exactly one candidate survives the last stage.
pub struct SamplerChain {
    samplers: Vec<Box<dyn Sampler>>,
}

impl SamplerChain {
    /// Create a new empty sampler chain.
    pub fn new() -> Self {
        Self {
            samplers: Vec::new(),
        }
    }

    /// Add a stage to the end of the chain. Returns self for builder-style usage.
    pub fn with(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.samplers.push(sampler);
        self
    }

    /// Add a stage to the end of the chain.
    pub fn push(&mut self, sampler: Box<dyn Sampler>) {
        self.samplers.push(sampler);
    }

    /// Names of the registered stages, in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.samplers.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// Run every stage on `logits` (indexed by token id) and return the
    /// selected token id.
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(SamplerError::EmptyLogits);
        }
        if self.samplers.is_empty() {
            return Err(SamplerError::EmptyChain);
        }

        let mut candidates: Vec<TokenLogit> = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenLogit {
                token_id: i as u32,
                logit,
            })
            .collect();

        for sampler in self.samplers.iter_mut() {
            sampler.apply(&mut candidates);
        }

        match candidates.as_slice() {
            [selected] => Ok(selected.token_id),
            rest => Err(SamplerError::Unresolved {
                remaining: rest.len(),
            }),
        }
    }

    /// Feed the chosen token back to every stage.
    pub fn accept(&mut self, token_id: u32) {
        for sampler in self.samplers.iter_mut() {
            sampler.accept(token_id);
        }
    }

    /// Reset every stage.
    pub fn reset(&mut self) {
        for sampler in self.samplers.iter_mut() {
            sampler.reset();
        }
    }
}

impl Default for SamplerChain {
    fn default() -> Self {
        Self::new()
    }
}
