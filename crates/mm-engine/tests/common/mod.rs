#![allow(dead_code)]

use std::collections::VecDeque;

use mm_engine::{Batch, ModelRuntime};
use mm_model::{BpeTokenizer, ModelError, Result, SeqId, TokenId, Vocab};

pub const N_EMBD: usize = 4;

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
pub const BYTE_E4: TokenId = 3;
pub const BYTE_BD: TokenId = 4;
pub const BYTE_A0: TokenId = 5;
pub const HELLO: TokenId = 13;
pub const SPACE: TokenId = 14;
pub const WORLD: TokenId = 21;
pub const HASH: TokenId = 22;
pub const HASH2: TokenId = 23;
pub const IM_END: TokenId = 24;
pub const BYTE_80: TokenId = 25;

pub fn tokenizer() -> BpeTokenizer {
    let tokens: Vec<String> = [
        "<unk>", "<s>", "</s>", "<0xE4>", "<0xBD>", "<0xA0>", "H", "e", "l", "o", "He", "ll",
        "llo", "Hello", " ", "w", "r", "d", "wo", "rl", "rld", "world", "#", "##",
        "<|im_end|>", "<0x80>",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let vocab = Vocab::new(tokens, BOS, EOS)
        .unwrap()
        .with_unk(0)
        .unwrap()
        .with_eot(IM_END)
        .unwrap();
    let merges = [
        "H e", "l l", "ll o", "He llo", "w o", "r l", "rl d", "wo rld", "# #",
    ];
    BpeTokenizer::new(vocab, &merges).unwrap()
}

/// In-memory model: embeddings are the token id repeated, and every logits
/// row is one-hot on the next token of a script.
pub struct ScriptedRuntime {
    tokenizer: BpeTokenizer,
    n_ctx: usize,
    script: VecDeque<TokenId>,
    default_token: TokenId,
    /// Every batch passed to `forward`, including failed calls.
    pub batches: Vec<Batch>,
    pub forward_calls: usize,
    /// 1-based index of the forward call that fails.
    pub fail_on_forward: Option<usize>,
    /// Return no logits rows at all.
    pub drop_outputs: bool,
    pub cleared: Vec<SeqId>,
}

impl ScriptedRuntime {
    pub fn new(n_ctx: usize, script: &[TokenId]) -> Self {
        ScriptedRuntime {
            tokenizer: tokenizer(),
            n_ctx,
            script: script.iter().copied().collect(),
            default_token: SPACE,
            batches: Vec::new(),
            forward_calls: 0,
            fail_on_forward: None,
            drop_outputs: false,
            cleared: Vec::new(),
        }
    }

    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on_forward = Some(call);
        self
    }

    fn one_hot(&self, token: TokenId) -> Vec<f32> {
        let mut row = vec![0.0; self.n_vocab()];
        row[token as usize] = 1.0;
        row
    }
}

impl ModelRuntime for ScriptedRuntime {
    fn tokenize(&self, text: &str, add_bos: bool, special: bool) -> Result<Vec<TokenId>> {
        self.tokenizer.encode(text, add_bos, special)
    }

    fn token_to_piece(&self, token_id: TokenId) -> Result<Vec<u8>> {
        self.tokenizer.token_to_piece(token_id)
    }

    fn n_vocab(&self) -> usize {
        self.tokenizer.n_vocab()
    }

    fn n_embd(&self) -> usize {
        N_EMBD
    }

    fn embedding_lookup(&self, token_id: TokenId) -> Result<Vec<f32>> {
        if token_id as usize >= self.n_vocab() {
            return Err(ModelError::TokenOutOfRange {
                token_id,
                n_vocab: self.n_vocab(),
            });
        }
        Ok(vec![token_id as f32; N_EMBD])
    }

    fn forward(&mut self, batch: &Batch) -> Result<Vec<Vec<f32>>> {
        self.forward_calls += 1;
        self.batches.push(batch.clone());
        if self.fail_on_forward == Some(self.forward_calls) {
            return Err(ModelError::Other("injected forward failure".to_string()));
        }
        if self.drop_outputs {
            return Ok(Vec::new());
        }
        let mut rows = Vec::with_capacity(batch.n_outputs());
        for _ in 0..batch.n_outputs() {
            let next = self.script.pop_front().unwrap_or(self.default_token);
            rows.push(self.one_hot(next));
        }
        Ok(rows)
    }

    fn is_end_of_generation(&self, token_id: TokenId) -> bool {
        self.tokenizer.is_eog(token_id)
    }

    fn context_capacity(&self) -> usize {
        self.n_ctx
    }

    fn clear_sequence(&mut self, seq_id: SeqId) {
        self.cleared.push(seq_id);
    }
}
