use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid embedding block magic: expected 'MMEB', got {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("unsupported embedding block version: {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported embedding dtype id: {0}")]
    UnsupportedDType(u32),
    #[error("embedding payload truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("embedding block of {n_positions} positions x {embed_dim} dims overflows")]
    SizeOverflow { n_positions: usize, embed_dim: usize },
    #[error("embedding block has {got} values, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("token id {token_id} out of range for vocabulary of {n_vocab}")]
    TokenOutOfRange { token_id: u32, n_vocab: usize },
    #[error("tokenizer error: {0}")]
    TokenizerError(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
