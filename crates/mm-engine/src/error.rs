use thiserror::Error;

use mm_model::{ModelError, SeqId, TokenId};
use mm_sampler::SamplerError;

use crate::generation::SessionState;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("empty batch: a forward pass needs at least one slot")]
    EmptyBatch,
    #[error("KV cache capacity exceeded for sequence {seq_id}: n_past {n_past} + {n_slots} slots > n_ctx {n_ctx}")]
    CapacityExceeded {
        seq_id: SeqId,
        n_past: usize,
        n_slots: usize,
        n_ctx: usize,
    },
    #[error("embedding lookup failed for token {token_id}: {reason}")]
    EmbeddingLookup { token_id: TokenId, reason: String },
    #[error("dimension mismatch: {what} (expected {expected}, got {got})")]
    DimensionMismatch {
        what: String,
        expected: usize,
        got: usize,
    },
    #[error("decode failed for sequence {seq_id} at position {position}: {reason}")]
    DecodeFailure {
        seq_id: SeqId,
        position: usize,
        reason: String,
    },
    #[error("malformed token stream: after token {token_id}, {pending} pending bytes cannot form valid UTF-8")]
    MalformedTokenStream { token_id: TokenId, pending: usize },
    #[error("invalid inline image tag: {reason}")]
    InvalidImageTag { reason: String },
    #[error("{operation} is not valid while the session is {state}")]
    SessionState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("sampling failed: {0}")]
    Sampler(#[from] SamplerError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
