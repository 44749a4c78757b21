use std::ffi::CString;
use std::os::raw::{c_char, c_void};

use mm_engine::{Batch, ModelRuntime};
use mm_model::{ModelError, Result, SeqId, TokenId};

use crate::types::{MMBatchView, MMModelCallbacks};

const PIECE_BUF: usize = 32;

type Tokenize = extern "C" fn(
    *mut c_void,
    *const c_char,
    bool,
    bool,
    *mut u32,
    usize,
    *mut usize,
) -> i32;
type TokenToPiece = extern "C" fn(*mut c_void, u32, *mut u8, usize, *mut usize) -> i32;
type EmbeddingLookup = extern "C" fn(*mut c_void, u32, *mut f32, usize) -> i32;
type Forward = extern "C" fn(*mut c_void, *const MMBatchView, *mut f32, usize) -> i32;
type IsEog = extern "C" fn(*mut c_void, u32) -> bool;
type ClearSequence = extern "C" fn(*mut c_void, u32);

/// `ModelRuntime` over a host-supplied callback table.
pub struct CallbackRuntime {
    user_data: *mut c_void,
    n_vocab: usize,
    n_embd: usize,
    n_ctx: usize,
    tokenize: Tokenize,
    token_to_piece: TokenToPiece,
    embedding_lookup: EmbeddingLookup,
    forward: Forward,
    is_eog: IsEog,
    clear_sequence: ClearSequence,
}

// The host owns `user_data` and promises it may be used from whichever
// thread drives the session; the session mutex serializes all calls.
unsafe impl Send for CallbackRuntime {}

impl CallbackRuntime {
    /// Validate a callback table. Every callback and size must be present.
    pub fn new(cb: &MMModelCallbacks) -> std::result::Result<Self, String> {
        fn need<T>(f: Option<T>, name: &str) -> std::result::Result<T, String> {
            f.ok_or_else(|| format!("callback {} is null", name))
        }
        if cb.n_vocab == 0 || cb.n_embd == 0 || cb.n_ctx == 0 {
            return Err(format!(
                "n_vocab, n_embd and n_ctx must be non-zero (got {}, {}, {})",
                cb.n_vocab, cb.n_embd, cb.n_ctx
            ));
        }
        Ok(CallbackRuntime {
            user_data: cb.user_data,
            n_vocab: cb.n_vocab as usize,
            n_embd: cb.n_embd as usize,
            n_ctx: cb.n_ctx as usize,
            tokenize: need(cb.tokenize, "tokenize")?,
            token_to_piece: need(cb.token_to_piece, "token_to_piece")?,
            embedding_lookup: need(cb.embedding_lookup, "embedding_lookup")?,
            forward: need(cb.forward, "forward")?,
            is_eog: need(cb.is_end_of_generation, "is_end_of_generation")?,
            clear_sequence: need(cb.clear_sequence, "clear_sequence")?,
        })
    }
}

fn callback_failed(name: &str, code: i32) -> ModelError {
    ModelError::Other(format!("{} callback returned {}", name, code))
}

impl ModelRuntime for CallbackRuntime {
    fn tokenize(&self, text: &str, add_bos: bool, special: bool) -> Result<Vec<TokenId>> {
        let c_text = CString::new(text)
            .map_err(|e| ModelError::TokenizerError(format!("text contains NUL: {}", e)))?;

        let mut out = vec![0u32; text.len() + 2];
        loop {
            let mut n_out = 0usize;
            let code = (self.tokenize)(
                self.user_data,
                c_text.as_ptr(),
                add_bos,
                special,
                out.as_mut_ptr(),
                out.len(),
                &mut n_out,
            );
            if code != 0 {
                return Err(callback_failed("tokenize", code));
            }
            if n_out <= out.len() {
                out.truncate(n_out);
                return Ok(out);
            }
            out.resize(n_out, 0);
        }
    }

    fn token_to_piece(&self, token_id: TokenId) -> Result<Vec<u8>> {
        let mut out = vec![0u8; PIECE_BUF];
        loop {
            let mut n_out = 0usize;
            let code = (self.token_to_piece)(
                self.user_data,
                token_id,
                out.as_mut_ptr(),
                out.len(),
                &mut n_out,
            );
            if code != 0 {
                return Err(callback_failed("token_to_piece", code));
            }
            if n_out <= out.len() {
                out.truncate(n_out);
                return Ok(out);
            }
            out.resize(n_out, 0);
        }
    }

    fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    fn n_embd(&self) -> usize {
        self.n_embd
    }

    fn embedding_lookup(&self, token_id: TokenId) -> Result<Vec<f32>> {
        let mut row = vec![0f32; self.n_embd];
        let code = (self.embedding_lookup)(self.user_data, token_id, row.as_mut_ptr(), self.n_embd);
        if code != 0 {
            return Err(callback_failed("embedding_lookup", code));
        }
        Ok(row)
    }

    fn forward(&mut self, batch: &Batch) -> Result<Vec<Vec<f32>>> {
        let positions: Vec<i32> = batch.positions().iter().map(|&p| p as i32).collect();
        let seq_ids: Vec<u32> = (0..batch.len())
            .map(|i| batch.seq_ids(i).first().copied().unwrap_or(0))
            .collect();
        let logits = batch.logits_flags().to_vec();
        let n_outputs = batch.n_outputs();

        let (tokens, embeddings, embed_dim) = match (batch.tokens(), batch.embeddings()) {
            (Some(t), _) => (t.as_ptr(), std::ptr::null(), 0),
            (None, Some((data, dim))) => (std::ptr::null(), data.as_ptr(), dim),
            (None, None) => (std::ptr::null(), std::ptr::null(), 0),
        };
        let layout = batch.image_layout();

        let view = MMBatchView {
            n_slots: batch.len(),
            tokens,
            embeddings,
            embed_dim,
            positions: positions.as_ptr(),
            seq_ids: seq_ids.as_ptr(),
            logits: logits.as_ptr(),
            n_outputs,
            image_start: layout.map_or(0, |l| l.start),
            image_n_positions: layout.map_or(0, |l| l.n_positions),
            image_token_step: layout.map_or(0, |l| l.step),
        };

        let mut out = vec![0f32; n_outputs * self.n_vocab];
        let code = (self.forward)(self.user_data, &view, out.as_mut_ptr(), self.n_vocab);
        if code != 0 {
            return Err(callback_failed("forward", code));
        }
        Ok(out.chunks_exact(self.n_vocab).map(<[f32]>::to_vec).collect())
    }

    fn is_end_of_generation(&self, token_id: TokenId) -> bool {
        (self.is_eog)(self.user_data, token_id)
    }

    fn context_capacity(&self) -> usize {
        self.n_ctx
    }

    fn clear_sequence(&mut self, seq_id: SeqId) {
        (self.clear_sequence)(self.user_data, seq_id)
    }
}
