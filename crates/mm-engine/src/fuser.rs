use mm_model::{ImageEmbed, SeqId, TokenId};
use tracing::debug;

use crate::batch::{Batch, BatchInput, ImageLayout};
use crate::error::{EngineError, Result};
use crate::runtime::ModelRuntime;

/// Number of projector layers the image block is divided over by default.
pub const DEFAULT_PROJECTOR_LAYERS: usize = 32;

/// How `image_token_step` is derived for an image block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStride {
    /// `n_positions / layers`.
    Layers(usize),
    /// A fixed step.
    Explicit(usize),
}

impl Default for ImageStride {
    fn default() -> Self {
        ImageStride::Layers(DEFAULT_PROJECTOR_LAYERS)
    }
}

impl ImageStride {
    /// Resolve the step for a block of `n_positions`.
    ///
    /// The step must be non-zero and divide `n_positions`.
    pub fn resolve(self, n_positions: usize) -> Result<usize> {
        let step = match self {
            ImageStride::Layers(0) => 0,
            ImageStride::Layers(layers) => n_positions / layers,
            ImageStride::Explicit(step) => step,
        };
        if step == 0 || n_positions % step != 0 {
            return Err(EngineError::DimensionMismatch {
                what: format!(
                    "image block of {} positions cannot be split by {:?}",
                    n_positions, self
                ),
                expected: step,
                got: n_positions,
            });
        }
        Ok(step)
    }
}

/// One embedding vector per prompt position: system, image, then user.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedPrompt {
    embeddings: Vec<f32>,
    embed_dim: usize,
    n_system: usize,
    n_image: usize,
    n_user: usize,
    image_token_step: Option<usize>,
}

impl FusedPrompt {
    /// Total positions: `n_system + n_image + n_user`.
    pub fn n_eval(&self) -> usize {
        self.n_system + self.n_image + self.n_user
    }

    pub fn embeddings(&self) -> &[f32] {
        &self.embeddings
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn n_system(&self) -> usize {
        self.n_system
    }

    pub fn n_image(&self) -> usize {
        self.n_image
    }

    pub fn n_user(&self) -> usize {
        self.n_user
    }

    /// Absent when the image block is empty.
    pub fn image_token_step(&self) -> Option<usize> {
        self.image_token_step
    }

    pub fn image_layout(&self) -> Option<ImageLayout> {
        self.image_token_step.map(|step| ImageLayout {
            start: self.n_system,
            n_positions: self.n_image,
            step,
        })
    }

    /// Turn the fused prompt into one prefill batch starting at `start_position`.
    pub fn into_batch(self, start_position: usize, seq_id: SeqId) -> Result<Batch> {
        let layout = self.image_layout();
        let batch = Batch::prefill(
            BatchInput::Embeddings {
                data: self.embeddings,
                embed_dim: self.embed_dim,
            },
            start_position,
            seq_id,
        )?;
        match layout {
            Some(layout) => batch.with_image(layout),
            None => Ok(batch),
        }
    }
}

/// Builds the embedding sequence for a system-text + image + user-text prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingFuser {
    stride: ImageStride,
}

impl EmbeddingFuser {
    pub fn new(stride: ImageStride) -> Self {
        EmbeddingFuser { stride }
    }

    pub fn stride(&self) -> ImageStride {
        self.stride
    }

    /// Tokenize and fuse. System text gets BOS, user text does not; both
    /// parse control tokens.
    pub fn fuse<R: ModelRuntime + ?Sized>(
        &self,
        runtime: &R,
        system: &str,
        image: &ImageEmbed,
        user: &str,
    ) -> Result<FusedPrompt> {
        let system_tokens = runtime.tokenize(system, true, true)?;
        let user_tokens = runtime.tokenize(user, false, true)?;
        self.fuse_tokens(
            &system_tokens,
            image,
            &user_tokens,
            runtime.n_embd(),
            runtime.n_vocab(),
            |id| runtime.embedding_lookup(id),
        )
    }

    /// Fuse already tokenized regions, looking up each token's vector.
    pub fn fuse_tokens<F>(
        &self,
        system_tokens: &[TokenId],
        image: &ImageEmbed,
        user_tokens: &[TokenId],
        embed_dim: usize,
        n_vocab: usize,
        mut lookup: F,
    ) -> Result<FusedPrompt>
    where
        F: FnMut(TokenId) -> mm_model::Result<Vec<f32>>,
    {
        let n_image = image.n_positions();
        if n_image > 0 && image.embed_dim() != embed_dim {
            return Err(EngineError::DimensionMismatch {
                what: "image embedding width differs from the model's".to_string(),
                expected: embed_dim,
                got: image.embed_dim(),
            });
        }
        let image_token_step = if n_image > 0 {
            Some(self.stride.resolve(n_image)?)
        } else {
            None
        };

        let n_eval = system_tokens.len() + n_image + user_tokens.len();
        let mut embeddings = Vec::with_capacity(n_eval * embed_dim);

        let mut push_tokens = |tokens: &[TokenId], out: &mut Vec<f32>| -> Result<()> {
            for &id in tokens {
                if id as usize >= n_vocab {
                    return Err(EngineError::EmbeddingLookup {
                        token_id: id,
                        reason: format!("outside vocabulary of {} tokens", n_vocab),
                    });
                }
                let row = lookup(id).map_err(|e| EngineError::EmbeddingLookup {
                    token_id: id,
                    reason: e.to_string(),
                })?;
                if row.len() != embed_dim {
                    return Err(EngineError::DimensionMismatch {
                        what: format!("embedding row for token {}", id),
                        expected: embed_dim,
                        got: row.len(),
                    });
                }
                out.extend_from_slice(&row);
            }
            Ok(())
        };

        push_tokens(system_tokens, &mut embeddings)?;
        embeddings.extend_from_slice(image.data());
        push_tokens(user_tokens, &mut embeddings)?;

        debug!(
            n_system = system_tokens.len(),
            n_image,
            n_user = user_tokens.len(),
            image_token_step,
            "fused multimodal prompt"
        );

        Ok(FusedPrompt {
            embeddings,
            embed_dim,
            n_system: system_tokens.len(),
            n_image,
            n_user: user_tokens.len(),
            image_token_step,
        })
    }
}
