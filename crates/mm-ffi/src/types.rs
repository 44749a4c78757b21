use std::ffi::CStr;
use std::os::raw::{c_char, c_void};

use mm_engine::{ContextParams, GenerationConfig, ImageStride, SamplerParams, StopReason};

/// Status codes returned by all FFI functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MMStatus {
    Ok = 0,
    ErrorInvalidArgument = 1,
    ErrorInvalidHandle = 2,
    ErrorBusy = 3,
    ErrorSessionState = 4,
    ErrorEmptyBatch = 5,
    ErrorCapacityExceeded = 6,
    ErrorEmbeddingLookup = 7,
    ErrorDimensionMismatch = 8,
    ErrorDecode = 9,
    ErrorMalformedTokenStream = 10,
    ErrorModel = 11,
    ErrorSampler = 12,
    ErrorInternal = 13,
    ErrorInvalidImageTag = 14,
}

/// Why a session stopped, or `None` while it has not.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MMStopReason {
    None = 0,
    EndOfGeneration = 1,
    MaxLength = 2,
    StopString = 3,
    CapacityExceeded = 4,
    DecodeFailure = 5,
    MalformedTokenStream = 6,
    SamplingFailure = 7,
}

impl From<Option<&StopReason>> for MMStopReason {
    fn from(reason: Option<&StopReason>) -> Self {
        match reason {
            None => MMStopReason::None,
            Some(StopReason::EndOfGeneration) => MMStopReason::EndOfGeneration,
            Some(StopReason::MaxLength) => MMStopReason::MaxLength,
            Some(StopReason::StopString(_)) => MMStopReason::StopString,
            Some(StopReason::CapacityExceeded) => MMStopReason::CapacityExceeded,
            Some(StopReason::DecodeFailure) => MMStopReason::DecodeFailure,
            Some(StopReason::MalformedTokenStream) => MMStopReason::MalformedTokenStream,
            Some(StopReason::SamplingFailure) => MMStopReason::SamplingFailure,
        }
    }
}

/// Opaque session handle. Zero is never a valid handle.
pub type MMSessionHandle = u64;

/// Context-creation hints for the host's model runtime.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MMContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_threads: u32,
}

impl From<ContextParams> for MMContextParams {
    fn from(p: ContextParams) -> Self {
        MMContextParams {
            n_ctx: p.n_ctx as u32,
            n_batch: p.n_batch as u32,
            n_ubatch: p.n_ubatch as u32,
            n_threads: p.n_threads as u32,
        }
    }
}

/// Parameters controlling one generation session.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct MMGenerationParams {
    pub max_length: u32,
    pub n_batch: u32,
    pub seq_id: u32,
    /// Image stride as `n_positions / image_layers`; used when `image_step` is 0.
    pub image_layers: u32,
    /// Explicit image stride; 0 selects `image_layers`.
    pub image_step: u32,
    pub max_pending_bytes: u32,
    pub greedy: bool,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub repetition_window: u32,
    pub seed: u64,
    /// Array of `n_stop_strings` NUL-terminated strings; may be null when empty.
    pub stop_strings: *const *const c_char,
    pub n_stop_strings: usize,
}

impl Default for MMGenerationParams {
    fn default() -> Self {
        let config = GenerationConfig::default();
        let (image_layers, image_step) = match config.image_stride {
            ImageStride::Layers(n) => (n as u32, 0),
            ImageStride::Explicit(step) => (0, step as u32),
        };
        Self {
            max_length: config.max_length as u32,
            n_batch: config.n_batch as u32,
            seq_id: config.seq_id,
            image_layers,
            image_step,
            max_pending_bytes: config.max_pending_bytes as u32,
            greedy: config.sampler.greedy,
            temperature: config.sampler.temperature,
            top_k: config.sampler.top_k as u32,
            top_p: config.sampler.top_p,
            repetition_penalty: config.sampler.repetition_penalty,
            repetition_window: config.sampler.repetition_window as u32,
            seed: config.sampler.seed,
            stop_strings: std::ptr::null(),
            n_stop_strings: 0,
        }
    }
}

impl MMGenerationParams {
    /// Convert to an engine config, copying the stop strings.
    ///
    /// # Safety
    /// `stop_strings` must be null or point to `n_stop_strings` valid
    /// NUL-terminated strings.
    pub unsafe fn to_config(&self) -> Result<GenerationConfig, String> {
        let mut stop_strings = Vec::with_capacity(self.n_stop_strings);
        if self.n_stop_strings > 0 {
            if self.stop_strings.is_null() {
                return Err("stop_strings is null but n_stop_strings > 0".to_string());
            }
            for i in 0..self.n_stop_strings {
                let ptr = *self.stop_strings.add(i);
                if ptr.is_null() {
                    return Err(format!("stop string {} is null", i));
                }
                let s = CStr::from_ptr(ptr)
                    .to_str()
                    .map_err(|e| format!("stop string {}: {}", i, e))?;
                stop_strings.push(s.to_string());
            }
        }

        let image_stride = if self.image_step > 0 {
            ImageStride::Explicit(self.image_step as usize)
        } else {
            ImageStride::Layers(self.image_layers as usize)
        };

        Ok(GenerationConfig {
            max_length: self.max_length as usize,
            stop_strings,
            n_batch: self.n_batch as usize,
            seq_id: self.seq_id,
            image_stride,
            max_pending_bytes: self.max_pending_bytes as usize,
            sampler: SamplerParams {
                greedy: self.greedy,
                temperature: self.temperature,
                top_k: self.top_k as usize,
                top_p: self.top_p,
                repetition_penalty: self.repetition_penalty,
                repetition_window: self.repetition_window as usize,
                seed: self.seed,
            },
        })
    }
}

/// Read-only view of one batch, handed to the host's `forward` callback.
///
/// Exactly one of `tokens` and `embeddings` is non-null. Every array has
/// `n_slots` entries (`embeddings` has `n_slots * embed_dim`).
#[repr(C)]
#[derive(Debug)]
pub struct MMBatchView {
    pub n_slots: usize,
    pub tokens: *const u32,
    pub embeddings: *const f32,
    pub embed_dim: usize,
    pub positions: *const i32,
    pub seq_ids: *const u32,
    pub logits: *const bool,
    /// Number of slots with `logits` set; rows the callback must write.
    pub n_outputs: usize,
    pub image_start: usize,
    pub image_n_positions: usize,
    /// 0 when the batch has no image region.
    pub image_token_step: usize,
}

/// The model collaborator, supplied by the host as plain C callbacks.
///
/// Every callback receives `user_data` first. Callbacks that return `i32`
/// return 0 on success and any other value on failure.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MMModelCallbacks {
    pub user_data: *mut c_void,
    pub n_vocab: u32,
    pub n_embd: u32,
    pub n_ctx: u32,
    /// Write up to `cap` ids to `out` and the full count to `*n_out`. If the
    /// count exceeds `cap` the call is repeated with a large enough buffer.
    pub tokenize: Option<
        extern "C" fn(
            user_data: *mut c_void,
            text: *const c_char,
            add_bos: bool,
            special: bool,
            out: *mut u32,
            cap: usize,
            n_out: *mut usize,
        ) -> i32,
    >,
    /// Same buffer protocol as `tokenize`, for the raw bytes of one token.
    pub token_to_piece: Option<
        extern "C" fn(
            user_data: *mut c_void,
            token: u32,
            out: *mut u8,
            cap: usize,
            n_out: *mut usize,
        ) -> i32,
    >,
    /// Write `n_embd` floats to `out`.
    pub embedding_lookup:
        Option<extern "C" fn(user_data: *mut c_void, token: u32, out: *mut f32, n_embd: usize) -> i32>,
    /// Run the batch and write `n_outputs * n_vocab` logits to `logits_out`,
    /// one row per slot with `logits` set, in slot order.
    pub forward: Option<
        extern "C" fn(
            user_data: *mut c_void,
            batch: *const MMBatchView,
            logits_out: *mut f32,
            n_vocab: usize,
        ) -> i32,
    >,
    pub is_end_of_generation: Option<extern "C" fn(user_data: *mut c_void, token: u32) -> bool>,
    pub clear_sequence: Option<extern "C" fn(user_data: *mut c_void, seq_id: u32)>,
}

/// Callback for streaming text chunks.
/// Returns true to continue generation, false to stop.
pub type MMStreamCallback = Option<
    extern "C" fn(
        chunk: *const c_char,
        user_data: *mut c_void,
    ) -> bool,
>;
