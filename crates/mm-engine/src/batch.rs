use mm_model::{SeqId, TokenId};

use crate::error::{EngineError, Result};

/// Slot contents of a batch: token ids or dense vectors, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchInput {
    Tokens(Vec<TokenId>),
    /// Row-major `[n_slots, embed_dim]`.
    Embeddings { data: Vec<f32>, embed_dim: usize },
}

impl BatchInput {
    /// Number of slots this input occupies.
    pub fn n_slots(&self) -> usize {
        match self {
            BatchInput::Tokens(t) => t.len(),
            BatchInput::Embeddings { data, embed_dim } => {
                if *embed_dim == 0 {
                    0
                } else {
                    data.len() / embed_dim
                }
            }
        }
    }
}

/// Where the image block sits inside an embeddings batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// First slot of the image region.
    pub start: usize,
    /// Number of image slots.
    pub n_positions: usize,
    /// Image slots per projector "virtual layer". Divides `n_positions`.
    pub step: usize,
}

/// One forward-pass request, stored as parallel per-slot columns.
///
/// Built fresh for each forward pass and dropped after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    input: BatchInput,
    positions: Vec<usize>,
    seq_ids: Vec<Vec<SeqId>>,
    logits: Vec<bool>,
    image: Option<ImageLayout>,
}

impl Batch {
    /// Build a prefill batch at positions `start_position..start_position + n`.
    ///
    /// Only the last slot requests logits.
    pub fn prefill(input: BatchInput, start_position: usize, seq_id: SeqId) -> Result<Batch> {
        if let BatchInput::Embeddings { data, embed_dim } = &input {
            if *embed_dim == 0 || data.len() % embed_dim != 0 {
                return Err(EngineError::DimensionMismatch {
                    what: "embedding batch length must be a multiple of embed_dim".to_string(),
                    expected: *embed_dim,
                    got: data.len(),
                });
            }
        }

        let n = input.n_slots();
        if n == 0 {
            return Err(EngineError::EmptyBatch);
        }

        let mut logits = vec![false; n];
        logits[n - 1] = true;

        Ok(Batch {
            input,
            positions: (start_position..start_position + n).collect(),
            seq_ids: vec![vec![seq_id]; n],
            logits,
            image: None,
        })
    }

    /// Build a one-token decode batch; its only slot requests logits.
    pub fn single_step(token_id: TokenId, position: usize, seq_id: SeqId) -> Batch {
        Batch {
            input: BatchInput::Tokens(vec![token_id]),
            positions: vec![position],
            seq_ids: vec![vec![seq_id]],
            logits: vec![true],
            image: None,
        }
    }

    /// Clear every `wants_logits` flag. Used for prefill chunks whose
    /// outputs are not needed.
    pub(crate) fn without_logits(mut self) -> Batch {
        self.logits.iter_mut().for_each(|l| *l = false);
        self
    }

    /// Tag the image region of an embeddings batch.
    pub fn with_image(mut self, layout: ImageLayout) -> Result<Batch> {
        if !matches!(self.input, BatchInput::Embeddings { .. }) {
            return Err(EngineError::DimensionMismatch {
                what: "image layout on a token batch".to_string(),
                expected: 0,
                got: layout.n_positions,
            });
        }
        if layout.start + layout.n_positions > self.len() {
            return Err(EngineError::DimensionMismatch {
                what: "image region past the end of the batch".to_string(),
                expected: self.len(),
                got: layout.start + layout.n_positions,
            });
        }
        if layout.step == 0 || layout.n_positions % layout.step != 0 {
            return Err(EngineError::DimensionMismatch {
                what: "image slots must be a multiple of image_token_step".to_string(),
                expected: layout.step,
                got: layout.n_positions,
            });
        }
        self.image = Some(layout);
        Ok(self)
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn input(&self) -> &BatchInput {
        &self.input
    }

    /// Token ids, for a token batch.
    pub fn tokens(&self) -> Option<&[TokenId]> {
        match &self.input {
            BatchInput::Tokens(t) => Some(t),
            BatchInput::Embeddings { .. } => None,
        }
    }

    /// Flattened vectors and their width, for an embeddings batch.
    pub fn embeddings(&self) -> Option<(&[f32], usize)> {
        match &self.input {
            BatchInput::Tokens(_) => None,
            BatchInput::Embeddings { data, embed_dim } => Some((data, *embed_dim)),
        }
    }

    /// The vector in slot `i`, for an embeddings batch.
    pub fn slot_embedding(&self, i: usize) -> Option<&[f32]> {
        let (data, dim) = self.embeddings()?;
        if i >= self.len() {
            return None;
        }
        Some(&data[i * dim..(i + 1) * dim])
    }

    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Sequence ids of slot `i`.
    pub fn seq_ids(&self, i: usize) -> &[SeqId] {
        self.seq_ids.get(i).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn wants_logits(&self, i: usize) -> bool {
        self.logits.get(i).copied().unwrap_or(false)
    }

    pub fn logits_flags(&self) -> &[bool] {
        &self.logits
    }

    /// Number of slots requesting logits.
    pub fn n_outputs(&self) -> usize {
        self.logits.iter().filter(|&&l| l).count()
    }

    pub fn image_layout(&self) -> Option<ImageLayout> {
        self.image
    }

    pub fn image_token_step(&self) -> Option<usize> {
        self.image.map(|l| l.step)
    }

    /// Position of the first slot.
    pub fn first_position(&self) -> usize {
        self.positions.first().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefill_tokens() {
        let b = Batch::prefill(BatchInput::Tokens(vec![5, 6, 7]), 10, 0).unwrap();
        assert_eq!(b.len(), 3);
        assert_eq!(b.positions(), &[10, 11, 12]);
        assert_eq!(b.logits_flags(), &[false, false, true]);
        assert_eq!(b.seq_ids(1), &[0]);
        assert_eq!(b.tokens(), Some(&[5, 6, 7][..]));
        assert!(b.embeddings().is_none());
        assert_eq!(b.n_outputs(), 1);
        assert_eq!(b.without_logits().n_outputs(), 0);
    }

    #[test]
    fn test_prefill_empty() {
        assert!(matches!(
            Batch::prefill(BatchInput::Tokens(vec![]), 0, 0),
            Err(EngineError::EmptyBatch)
        ));
        assert!(matches!(
            Batch::prefill(
                BatchInput::Embeddings {
                    data: vec![],
                    embed_dim: 4
                },
                0,
                0
            ),
            Err(EngineError::EmptyBatch)
        ));
    }

    #[test]
    fn test_prefill_ragged_embeddings() {
        let input = BatchInput::Embeddings {
            data: vec![0.0; 7],
            embed_dim: 4,
        };
        assert!(matches!(
            Batch::prefill(input, 0, 0),
            Err(EngineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_single_step() {
        let b = Batch::single_step(42, 17, 3);
        assert_eq!(b.positions(), &[17]);
        assert_eq!(b.logits_flags(), &[true]);
        assert_eq!(b.seq_ids(0), &[3]);
        assert_eq!(b.tokens(), Some(&[42][..]));
    }

    #[test]
    fn test_slot_embedding() {
        let input = BatchInput::Embeddings {
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            embed_dim: 2,
        };
        let b = Batch::prefill(input, 0, 0).unwrap();
        assert_eq!(b.len(), 3);
        assert_eq!(b.slot_embedding(1), Some(&[3.0, 4.0][..]));
        assert_eq!(b.slot_embedding(3), None);
    }

    #[test]
    fn test_image_layout_validation() {
        let make = || {
            Batch::prefill(
                BatchInput::Embeddings {
                    data: vec![0.0; 10 * 2],
                    embed_dim: 2,
                },
                0,
                0,
            )
            .unwrap()
        };
        let ok = make()
            .with_image(ImageLayout { start: 1, n_positions: 8, step: 4 })
            .unwrap();
        assert_eq!(ok.image_token_step(), Some(4));

        assert!(make()
            .with_image(ImageLayout { start: 1, n_positions: 8, step: 3 })
            .is_err());
        assert!(make()
            .with_image(ImageLayout { start: 1, n_positions: 8, step: 0 })
            .is_err());
        assert!(make()
            .with_image(ImageLayout { start: 4, n_positions: 8, step: 4 })
            .is_err());

        let tokens = Batch::single_step(1, 0, 0);
        assert!(tokens
            .with_image(ImageLayout { start: 0, n_positions: 1, step: 1 })
            .is_err());
    }
}
