use mm_model::{Result, SeqId, TokenId};

use crate::batch::Batch;

/// The model-side collaborator a session drives.
///
/// Implementations own the weights, the tokenizer and the KV storage, and
/// may parallelize the forward pass internally. The engine calls into them
/// from one thread, one call at a time.
pub trait ModelRuntime: Send {
    /// Tokenize `text`.
    ///
    /// - `add_bos`: prepend the beginning-of-sequence token.
    /// - `special`: parse control-token texts in `text` as control tokens.
    fn tokenize(&self, text: &str, add_bos: bool, special: bool) -> Result<Vec<TokenId>>;

    /// Raw bytes of one token. May be an incomplete UTF-8 sequence.
    fn token_to_piece(&self, token_id: TokenId) -> Result<Vec<u8>>;

    /// Vocabulary size; valid token ids are `0..n_vocab`.
    fn n_vocab(&self) -> usize;

    /// Width of the model's input embeddings.
    fn n_embd(&self) -> usize;

    /// Input embedding vector (length `n_embd`) for a token.
    fn embedding_lookup(&self, token_id: TokenId) -> Result<Vec<f32>>;

    /// Run the forward pass over `batch`, writing its slots into the KV cache
    /// at the batch positions.
    ///
    /// Returns one logits vector (length `n_vocab`) per slot whose
    /// `wants_logits` flag is set, in slot order.
    fn forward(&mut self, batch: &Batch) -> Result<Vec<Vec<f32>>>;

    /// True if `token_id` ends generation.
    fn is_end_of_generation(&self, token_id: TokenId) -> bool;

    /// KV cache capacity in positions.
    fn context_capacity(&self) -> usize;

    /// Drop every cached entry of `seq_id`. Must be safe on an empty sequence.
    fn clear_sequence(&mut self, seq_id: SeqId);
}
