use mm_model::SeqId;
use mm_sampler::{
    DistSampler, GreedySampler, RepetitionPenaltySampler, SamplerChain, TemperatureSampler,
    TopKSampler, TopPSampler,
};

use crate::detokenizer::DEFAULT_MAX_PENDING_BYTES;
use crate::fuser::ImageStride;

pub const DEFAULT_N_CTX: usize = 2048;
pub const DEFAULT_N_BATCH: usize = 512;
pub const DEFAULT_N_UBATCH: usize = 1024;
pub const DEFAULT_MAX_LENGTH: usize = 128;
pub const MAX_THREADS: usize = 8;

/// Worker threads for a machine with `logical_cpus` CPUs: leave two for the
/// host, use at least one and at most `MAX_THREADS`.
pub fn thread_count_for(logical_cpus: usize) -> usize {
    logical_cpus.saturating_sub(2).clamp(1, MAX_THREADS)
}

pub fn default_thread_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    thread_count_for(cpus)
}

/// Settings a runtime uses when it creates its context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    pub n_ctx: usize,
    pub n_batch: usize,
    pub n_ubatch: usize,
    pub n_threads: usize,
}

impl Default for ContextParams {
    fn default() -> Self {
        ContextParams {
            n_ctx: DEFAULT_N_CTX,
            n_batch: DEFAULT_N_BATCH,
            n_ubatch: DEFAULT_N_UBATCH,
            n_threads: default_thread_count(),
        }
    }
}

impl ContextParams {
    /// Make room for an image block and widen `n_batch` to the context size
    /// so a fused image prompt goes through one forward pass.
    pub fn for_multimodal(mut self) -> Self {
        self.n_ctx = self.n_ctx.max(DEFAULT_N_CTX);
        self.n_batch = self.n_batch.max(self.n_ctx);
        self.n_ubatch = self.n_ubatch.max(self.n_batch);
        self
    }
}

/// Which sampler stages to build, and their parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerParams {
    /// Argmax only; every other field is ignored.
    pub greedy: bool,
    pub temperature: f32,
    /// 0 disables top-k.
    pub top_k: usize,
    /// 1.0 disables top-p.
    pub top_p: f32,
    /// 1.0 disables the penalty.
    pub repetition_penalty: f32,
    pub repetition_window: usize,
    pub seed: u64,
}

impl Default for SamplerParams {
    fn default() -> Self {
        SamplerParams {
            greedy: true,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            repetition_penalty: 1.1,
            repetition_window: 64,
            seed: 0,
        }
    }
}

impl SamplerParams {
    /// Build the chain: repetition penalty, temperature, top-k, top-p, then
    /// a seeded weighted draw. Greedy builds the argmax selector alone.
    pub fn build_chain(&self) -> SamplerChain {
        if self.greedy {
            return SamplerChain::new().with(Box::new(GreedySampler::new()));
        }

        let mut chain = SamplerChain::new();
        if self.repetition_penalty != 1.0 && self.repetition_window > 0 {
            chain.push(Box::new(RepetitionPenaltySampler::new(
                self.repetition_penalty,
                self.repetition_window,
            )));
        }
        chain.push(Box::new(TemperatureSampler::new(self.temperature)));
        if self.top_k > 0 {
            chain.push(Box::new(TopKSampler::new(self.top_k)));
        }
        if self.top_p < 1.0 {
            chain.push(Box::new(TopPSampler::new(self.top_p)));
        }
        chain.push(Box::new(DistSampler::new(self.seed)));
        chain
    }
}

/// Per-session generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Maximum number of generated tokens.
    pub max_length: usize,
    /// Generation stops once the output text contains any of these.
    pub stop_strings: Vec<String>,
    /// Prefill chunk size for text prompts.
    pub n_batch: usize,
    pub seq_id: SeqId,
    pub image_stride: ImageStride,
    pub max_pending_bytes: usize,
    pub sampler: SamplerParams,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            max_length: DEFAULT_MAX_LENGTH,
            stop_strings: Vec::new(),
            n_batch: DEFAULT_N_BATCH,
            seq_id: 0,
            image_stride: ImageStride::default(),
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            sampler: SamplerParams::default(),
        }
    }
}

impl GenerationConfig {
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_stop_strings<S: Into<String>>(mut self, stops: impl IntoIterator<Item = S>) -> Self {
        self.stop_strings = stops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_image_stride(mut self, stride: ImageStride) -> Self {
        self.image_stride = stride;
        self
    }

    pub fn with_seq_id(mut self, seq_id: SeqId) -> Self {
        self.seq_id = seq_id;
        self
    }

    pub fn with_n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerParams) -> Self {
        self.sampler = sampler;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_count() {
        assert_eq!(thread_count_for(0), 1);
        assert_eq!(thread_count_for(2), 1);
        assert_eq!(thread_count_for(3), 1);
        assert_eq!(thread_count_for(6), 4);
        assert_eq!(thread_count_for(10), 8);
        assert_eq!(thread_count_for(64), 8);
        let n = default_thread_count();
        assert!((1..=MAX_THREADS).contains(&n));
    }

    #[test]
    fn test_context_defaults() {
        let p = ContextParams::default();
        assert_eq!(p.n_ctx, 2048);
        assert_eq!(p.n_batch, 512);
        assert_eq!(p.n_ubatch, 1024);
        let mm = p.for_multimodal();
        assert_eq!(mm.n_batch, 2048);
        assert_eq!(mm.n_ubatch, 2048);

        let small = ContextParams {
            n_ctx: 512,
            ..ContextParams::default()
        };
        assert_eq!(small.for_multimodal().n_ctx, 2048);
    }

    #[test]
    fn test_greedy_chain() {
        let chain = SamplerParams::default().build_chain();
        assert_eq!(chain.stage_names(), vec!["greedy"]);
    }

    #[test]
    fn test_full_chain_order() {
        let params = SamplerParams {
            greedy: false,
            ..SamplerParams::default()
        };
        let chain = params.build_chain();
        assert_eq!(
            chain.stage_names(),
            vec!["repetition_penalty", "temperature", "top_k", "top_p", "dist"]
        );
    }

    #[test]
    fn test_disabled_stages_skipped() {
        let params = SamplerParams {
            greedy: false,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            ..SamplerParams::default()
        };
        assert_eq!(params.build_chain().stage_names(), vec!["temperature", "dist"]);
    }

    #[test]
    fn test_generation_defaults() {
        let c = GenerationConfig::default();
        assert_eq!(c.max_length, 128);
        assert!(c.stop_strings.is_empty());
        assert_eq!(c.image_stride, ImageStride::Layers(32));
        assert_eq!(c.max_pending_bytes, 4);
        let c = c.with_max_length(5).with_stop_strings(["###"]);
        assert_eq!(c.max_length, 5);
        assert_eq!(c.stop_strings, vec!["###".to_string()]);
    }
}
