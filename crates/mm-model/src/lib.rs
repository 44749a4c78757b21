pub mod error;
pub mod image;
pub mod tokenizer;

pub use error::{ModelError, Result};
pub use image::{
    parse_embed_block, write_embed_block, EmbedDType, ImageEmbed, ImageEncoder, ImageSource,
    PrecomputedEmbeds,
};
pub use tokenizer::{BpeTokenizer, TokenKind, Vocab};

/// Vocabulary id of a token.
pub type TokenId = u32;

/// Logical sequence id inside a KV cache.
pub type SeqId = u32;
