//! `mm-engine` - incremental decode engine for causal language models.
//!
//! This crate provides:
//! - `Batch` construction for prefill and single-token decode
//! - `KvCacheManager`, the per-sequence position cursor with fail-fast capacity checks
//! - `EmbeddingFuser` for system-text + image-block + user-text prompts
//! - `StreamingDetokenizer`, which never emits a partial UTF-8 sequence
//! - `Session`, the generation state machine driving all of the above
//!
//! The model itself (tokenizer, embeddings, forward pass, KV storage) is
//! reached through the `ModelRuntime` trait.

pub mod batch;
pub mod config;
pub mod cursor;
pub mod detokenizer;
pub mod error;
pub mod fuser;
pub mod generation;
pub mod prompt;
pub mod runtime;

pub use batch::{Batch, BatchInput, ImageLayout};
pub use config::{ContextParams, GenerationConfig, SamplerParams};
pub use cursor::KvCacheManager;
pub use detokenizer::StreamingDetokenizer;
pub use error::{EngineError, Result};
pub use fuser::{EmbeddingFuser, FusedPrompt, ImageStride};
pub use generation::{Session, SessionState, StopReason};
pub use prompt::{ChatPrompt, InlineImage};
pub use runtime::ModelRuntime;

pub use mm_model::{ImageEmbed, SeqId, TokenId};
