use std::fmt;

use mm_model::{ImageEmbed, ImageEncoder, ImageSource, SeqId, TokenId};
use mm_sampler::SamplerChain;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchInput};
use crate::config::GenerationConfig;
use crate::cursor::KvCacheManager;
use crate::detokenizer::StreamingDetokenizer;
use crate::error::{EngineError, Result};
use crate::fuser::EmbeddingFuser;
use crate::prompt::ChatPrompt;
use crate::runtime::ModelRuntime;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndOfGeneration,
    MaxLength,
    StopString(String),
    CapacityExceeded,
    DecodeFailure,
    MalformedTokenStream,
    SamplingFailure,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndOfGeneration => write!(f, "end of generation"),
            StopReason::MaxLength => write!(f, "max length reached"),
            StopReason::StopString(s) => write!(f, "stop string {:?}", s),
            StopReason::CapacityExceeded => write!(f, "KV cache capacity exceeded"),
            StopReason::DecodeFailure => write!(f, "decode failure"),
            StopReason::MalformedTokenStream => write!(f, "malformed token stream"),
            StopReason::SamplingFailure => write!(f, "sampling failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prefilled,
    Generating,
    Stopped(StopReason),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Prefilled => write!(f, "prefilled"),
            SessionState::Generating => write!(f, "generating"),
            SessionState::Stopped(reason) => write!(f, "stopped ({})", reason),
        }
    }
}

/// Everything a reset throws away.
#[derive(Debug)]
struct GenerationState {
    n_generated: usize,
    /// Sampled but not yet run through the model.
    last_token: Option<TokenId>,
    logits: Vec<f32>,
    text: String,
    detokenizer: StreamingDetokenizer,
}

impl GenerationState {
    fn new(max_pending_bytes: usize) -> Self {
        GenerationState {
            n_generated: 0,
            last_token: None,
            logits: Vec::new(),
            text: String::new(),
            detokenizer: StreamingDetokenizer::new(max_pending_bytes),
        }
    }
}

/// First configured stop string whose match ends inside the newest
/// `chunk_len` bytes of `text`.
pub fn find_completed_stop<'a>(
    text: &str,
    chunk_len: usize,
    stop_strings: &'a [String],
) -> Option<&'a str> {
    if chunk_len == 0 {
        return None;
    }
    stop_strings
        .iter()
        .filter(|s| !s.is_empty())
        .find(|stop| {
            let mut from = text.len().saturating_sub(chunk_len + stop.len() - 1);
            while !text.is_char_boundary(from) {
                from -= 1;
            }
            text[from..].contains(stop.as_str())
        })
        .map(String::as_str)
}

/// One generation session over a model runtime.
///
/// The session owns the KV positions of its sequence id, the sampler chain
/// and all per-generation state. Prefill once, then call `step` until it
/// returns `None` or the state is `Stopped`; `reset` returns to `Idle`.
///
/// The token sampled in one step is run through the model at the start of
/// the next, so a step issues at most one forward pass.
pub struct Session<R: ModelRuntime> {
    runtime: R,
    config: GenerationConfig,
    sampler: SamplerChain,
    cache: KvCacheManager,
    fuser: EmbeddingFuser,
    state: SessionState,
    gen: GenerationState,
}

impl<R: ModelRuntime> Session<R> {
    /// Start a session with the sampler chain described by `config.sampler`.
    pub fn new(runtime: R, config: GenerationConfig) -> Self {
        let sampler = config.sampler.build_chain();
        Self::with_sampler(runtime, config, sampler)
    }

    /// Start a session with a caller-built sampler chain.
    pub fn with_sampler(mut runtime: R, config: GenerationConfig, sampler: SamplerChain) -> Self {
        let mut cache = KvCacheManager::new(runtime.context_capacity());
        cache.clear(config.seq_id, |seq| runtime.clear_sequence(seq));
        info!(
            seq_id = config.seq_id,
            n_ctx = cache.n_ctx(),
            max_length = config.max_length,
            "session started"
        );
        Session {
            fuser: EmbeddingFuser::new(config.image_stride),
            gen: GenerationState::new(config.max_pending_bytes),
            runtime,
            config,
            sampler,
            cache,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        match &self.state {
            SessionState::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn seq_id(&self) -> SeqId {
        self.config.seq_id
    }

    /// Positions filled in the KV cache for this session's sequence.
    pub fn n_past(&self) -> usize {
        self.cache.n_past(self.config.seq_id)
    }

    pub fn n_generated(&self) -> usize {
        self.gen.n_generated
    }

    /// All text emitted so far.
    pub fn generated_text(&self) -> &str {
        &self.gen.text
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    /// Tokenize `prompt` (with BOS) and run it through the model in chunks
    /// of at most `n_batch` tokens. Returns the number of tokens consumed.
    pub fn prefill_text(&mut self, prompt: &str) -> Result<usize> {
        self.ensure_idle("prefill_text")?;
        let seq_id = self.config.seq_id;

        let tokens = self.runtime.tokenize(prompt, true, false)?;
        if tokens.is_empty() {
            return Err(EngineError::EmptyBatch);
        }
        if let Err(e) = self.cache.capacity_check(seq_id, tokens.len()) {
            self.refuse_capacity(tokens.len());
            return Err(e);
        }
        if tokens.len() + self.config.max_length > self.cache.n_ctx() {
            warn!(
                seq_id,
                n_prompt = tokens.len(),
                max_length = self.config.max_length,
                n_ctx = self.cache.n_ctx(),
                "prompt plus max_length exceeds the context; generation may stop early"
            );
        }

        let n_batch = self.config.n_batch.max(1);
        let n_chunks = tokens.len().div_ceil(n_batch);
        debug!(seq_id, n_tokens = tokens.len(), n_chunks, "text prefill");

        let mut logits = None;
        for (i, chunk) in tokens.chunks(n_batch).enumerate() {
            let batch = Batch::prefill(
                BatchInput::Tokens(chunk.to_vec()),
                self.cache.n_past(seq_id),
                seq_id,
            )?;
            let batch = if i + 1 < n_chunks {
                batch.without_logits()
            } else {
                batch
            };
            logits = self.decode(&batch)?;
        }

        self.finish_prefill(logits)?;
        Ok(tokens.len())
    }

    /// Fuse system text, an image block and user text into one embeddings
    /// batch and run it. Returns `n_eval`, the number of positions consumed.
    pub fn prefill_multimodal(
        &mut self,
        system: &str,
        image: &ImageEmbed,
        user: &str,
    ) -> Result<usize> {
        self.ensure_idle("prefill_multimodal")?;
        let seq_id = self.config.seq_id;

        let fused = self.fuser.fuse(&self.runtime, system, image, user)?;
        let n_eval = fused.n_eval();
        info!(
            seq_id,
            n_system = fused.n_system(),
            n_image = fused.n_image(),
            n_user = fused.n_user(),
            n_eval,
            "multimodal prefill"
        );

        let batch = fused.into_batch(self.cache.n_past(seq_id), seq_id)?;
        let logits = self.decode(&batch)?;
        self.finish_prefill(logits)?;
        Ok(n_eval)
    }

    /// Split a chat prompt at its `<image>` placeholder and prefill it.
    pub fn prefill_chat(&mut self, prompt: &str, image: &ImageEmbed) -> Result<usize> {
        let chat = ChatPrompt::from_prompt(prompt);
        self.prefill_multimodal(&chat.system, image, &chat.user)
    }

    /// Prefill a chat prompt whose image travels inline as a base64
    /// `<img>` tag. The tag's bytes go through `encoder`; the text left
    /// after removing the tag is split like `prefill_chat`.
    pub fn prefill_inline_image(&mut self, prompt: &str, encoder: &impl ImageEncoder) -> Result<usize> {
        self.ensure_idle("prefill_inline_image")?;
        let inline = ChatPrompt::extract_inline_image(prompt)?.ok_or_else(|| {
            EngineError::InvalidImageTag {
                reason: "prompt has no inline image".to_string(),
            }
        })?;
        let image = encoder.embed_image(ImageSource::Bytes(&inline.bytes))?;
        debug!(
            seq_id = self.config.seq_id,
            n_bytes = inline.bytes.len(),
            n_positions = image.n_positions(),
            "decoded inline image"
        );
        self.prefill_chat(&inline.prompt, &image)
    }

    /// Generate one token.
    ///
    /// Returns the decoded text chunk, which is empty while a multi-byte
    /// character is still incomplete, or `None` once generation ended on an
    /// end-of-generation token. Stop strings and `max_length` end the
    /// session after the chunk that triggered them is returned.
    pub fn step(&mut self) -> Result<Option<String>> {
        match self.state {
            SessionState::Prefilled | SessionState::Generating => {}
            _ => {
                return Err(EngineError::SessionState {
                    operation: "step",
                    state: self.state.clone(),
                })
            }
        }
        self.state = SessionState::Generating;
        let seq_id = self.config.seq_id;

        if self.gen.n_generated >= self.config.max_length {
            self.stop(StopReason::MaxLength);
            return Ok(None);
        }

        if let Some(prev) = self.gen.last_token {
            let batch = Batch::single_step(prev, self.cache.n_past(seq_id), seq_id);
            if let Some(logits) = self.decode(&batch)? {
                self.gen.logits = logits;
            }
        }

        let token = match self.sampler.sample(&self.gen.logits) {
            Ok(token) => token,
            Err(e) => {
                warn!(seq_id, error = %e, "sampling failed");
                self.stop(StopReason::SamplingFailure);
                return Err(e.into());
            }
        };
        self.sampler.accept(token);
        self.gen.last_token = Some(token);

        if self.runtime.is_end_of_generation(token) {
            debug!(seq_id, token_id = token, "end-of-generation token");
            self.stop(StopReason::EndOfGeneration);
            return Ok(None);
        }

        let chunk = match self.gen.detokenizer.accept(&self.runtime, token) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(seq_id, token_id = token, error = %e, "detokenization failed");
                self.stop(StopReason::MalformedTokenStream);
                return Err(e);
            }
        };
        self.gen.n_generated += 1;
        self.gen.text.push_str(&chunk);

        let matched = find_completed_stop(&self.gen.text, chunk.len(), &self.config.stop_strings)
            .map(str::to_string);
        if let Some(stop) = matched {
            self.stop(StopReason::StopString(stop));
        } else if self.gen.n_generated >= self.config.max_length {
            self.stop(StopReason::MaxLength);
        }

        Ok(Some(chunk))
    }

    /// Drop the KV entries and all generation state; back to `Idle`.
    /// Valid in any state.
    pub fn reset(&mut self) {
        let seq_id = self.config.seq_id;
        let runtime = &mut self.runtime;
        self.cache.clear(seq_id, |seq| runtime.clear_sequence(seq));
        self.sampler.reset();
        self.gen = GenerationState::new(self.config.max_pending_bytes);
        self.state = SessionState::Idle;
        info!(seq_id, "session reset");
    }

    /// Clear this session's KV entries, keeping the runtime.
    pub fn release(&mut self) {
        let seq_id = self.config.seq_id;
        let runtime = &mut self.runtime;
        self.cache.clear(seq_id, |seq| runtime.clear_sequence(seq));
        info!(seq_id, n_generated = self.gen.n_generated, "session ended");
    }

    /// Clear this session's KV entries and hand the runtime back.
    pub fn end(mut self) -> R {
        self.release();
        self.runtime
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(EngineError::SessionState {
                operation,
                state: self.state.clone(),
            });
        }
        Ok(())
    }

    fn finish_prefill(&mut self, logits: Option<Vec<f32>>) -> Result<()> {
        match logits {
            Some(logits) => {
                self.gen.logits = logits;
                self.state = SessionState::Prefilled;
                debug!(seq_id = self.config.seq_id, n_past = self.n_past(), "prefill complete");
                Ok(())
            }
            None => {
                let position = self.n_past().saturating_sub(1);
                Err(self.decode_failed(position, "prefill produced no logits".to_string()))
            }
        }
    }

    /// Capacity check, forward pass, output validation, cursor advance.
    /// Returns the logits of the last output slot.
    fn decode(&mut self, batch: &Batch) -> Result<Option<Vec<f32>>> {
        let seq_id = self.config.seq_id;
        let position = batch.first_position();

        if let Err(e) = self.cache.capacity_check(seq_id, batch.len()) {
            self.refuse_capacity(batch.len());
            return Err(e);
        }

        let outputs = match self.runtime.forward(batch) {
            Ok(outputs) => outputs,
            Err(e) => return Err(self.decode_failed(position, e.to_string())),
        };
        if outputs.len() != batch.n_outputs() {
            let reason = format!(
                "expected {} logits rows, got {}",
                batch.n_outputs(),
                outputs.len()
            );
            return Err(self.decode_failed(position, reason));
        }
        let n_vocab = self.runtime.n_vocab();
        if let Some(row) = outputs.iter().find(|row| row.len() != n_vocab) {
            let reason = format!("logits row has {} values, vocabulary has {}", row.len(), n_vocab);
            return Err(self.decode_failed(position, reason));
        }

        self.cache.advance(seq_id, batch.len())?;
        Ok(outputs.into_iter().last())
    }

    fn refuse_capacity(&mut self, n_slots: usize) {
        let seq_id = self.config.seq_id;
        warn!(
            seq_id,
            n_past = self.cache.n_past(seq_id),
            n_slots,
            n_ctx = self.cache.n_ctx(),
            "KV cache full, refusing forward pass"
        );
        self.stop(StopReason::CapacityExceeded);
    }

    fn decode_failed(&mut self, position: usize, reason: String) -> EngineError {
        let seq_id = self.config.seq_id;
        warn!(seq_id, position, reason = %reason, "forward pass failed");
        self.stop(StopReason::DecodeFailure);
        EngineError::DecodeFailure {
            seq_id,
            position,
            reason,
        }
    }

    fn stop(&mut self, reason: StopReason) {
        let seq_id = self.config.seq_id;
        let dropped = self.gen.detokenizer.take_pending();
        if !dropped.is_empty() {
            warn!(seq_id, n_bytes = dropped.len(), "discarding incomplete UTF-8 at stop");
        }
        info!(
            seq_id,
            n_generated = self.gen.n_generated,
            n_past = self.cache.n_past(seq_id),
            reason = %reason,
            "session stopped"
        );
        self.state = SessionState::Stopped(reason);
    }
}
