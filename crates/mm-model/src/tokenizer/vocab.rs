use std::collections::HashMap;

use crate::error::{ModelError, Result};
use crate::TokenId;

/// How a vocabulary entry renders and participates in tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Ordinary text piece.
    Normal,
    /// Control token such as BOS/EOS. Only matched in input text when
    /// tokenizing with `special` enabled.
    Control,
    /// Byte-fallback token written `<0xHH>`; renders as that single raw byte.
    Byte(u8),
}

/// Parse a byte-fallback token of the form `<0xHH>`.
fn parse_byte_token(tok: &str) -> Option<u8> {
    if tok.len() == 6 && tok.starts_with("<0x") && tok.ends_with('>') {
        u8::from_str_radix(&tok[3..5], 16).ok()
    } else {
        None
    }
}

/// Token vocabulary with special-token bookkeeping.
pub struct Vocab {
    /// Token strings, indexed by token ID.
    tokens: Vec<String>,
    /// Kind of each token, indexed by token ID.
    kinds: Vec<TokenKind>,
    /// Reverse mapping from token string to token ID.
    token_to_id: HashMap<String, TokenId>,
    /// Beginning-of-sequence token ID.
    pub bos_id: TokenId,
    /// End-of-sequence token ID.
    pub eos_id: TokenId,
    /// Additional end-of-generation ids (end-of-turn markers).
    eot_ids: Vec<TokenId>,
    /// Fallback for characters with neither a piece nor byte tokens.
    unk_id: Option<TokenId>,
}

impl Vocab {
    /// Build a vocabulary from token strings.
    ///
    /// Tokens of the form `<0xHH>` become byte-fallback tokens; `bos_id` and
    /// `eos_id` are marked as control tokens.
    pub fn new(tokens: Vec<String>, bos_id: TokenId, eos_id: TokenId) -> Result<Vocab> {
        let n = tokens.len();
        for id in [bos_id, eos_id] {
            if id as usize >= n {
                return Err(ModelError::TokenOutOfRange {
                    token_id: id,
                    n_vocab: n,
                });
            }
        }

        let mut token_to_id = HashMap::with_capacity(n);
        let mut kinds = Vec::with_capacity(n);
        for (id, tok) in tokens.iter().enumerate() {
            if token_to_id.insert(tok.clone(), id as TokenId).is_some() {
                return Err(ModelError::TokenizerError(format!(
                    "duplicate token {:?} at id {}",
                    tok, id
                )));
            }
            kinds.push(match parse_byte_token(tok) {
                Some(b) => TokenKind::Byte(b),
                None => TokenKind::Normal,
            });
        }
        kinds[bos_id as usize] = TokenKind::Control;
        kinds[eos_id as usize] = TokenKind::Control;

        Ok(Vocab {
            tokens,
            kinds,
            token_to_id,
            bos_id,
            eos_id,
            eot_ids: Vec::new(),
            unk_id: None,
        })
    }

    fn check(&self, id: TokenId) -> Result<usize> {
        let idx = id as usize;
        if idx >= self.tokens.len() {
            return Err(ModelError::TokenOutOfRange {
                token_id: id,
                n_vocab: self.tokens.len(),
            });
        }
        Ok(idx)
    }

    /// Mark `id` as a control token.
    pub fn with_control(mut self, id: TokenId) -> Result<Self> {
        let idx = self.check(id)?;
        self.kinds[idx] = TokenKind::Control;
        Ok(self)
    }

    /// Mark `id` as an end-of-turn token: a control token that also ends generation.
    pub fn with_eot(mut self, id: TokenId) -> Result<Self> {
        let idx = self.check(id)?;
        self.kinds[idx] = TokenKind::Control;
        if !self.eot_ids.contains(&id) {
            self.eot_ids.push(id);
        }
        Ok(self)
    }

    /// Use `id` for characters the vocabulary cannot otherwise represent.
    pub fn with_unk(mut self, id: TokenId) -> Result<Self> {
        self.check(id)?;
        self.unk_id = Some(id);
        Ok(self)
    }

    /// Number of tokens in the vocabulary.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if the vocabulary is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    pub fn kind(&self, id: TokenId) -> Option<TokenKind> {
        self.kinds.get(id as usize).copied()
    }

    pub fn id_of(&self, text: &str) -> Option<TokenId> {
        self.token_to_id.get(text).copied()
    }

    pub fn unk_id(&self) -> Option<TokenId> {
        self.unk_id
    }

    /// True for EOS and any registered end-of-turn id.
    pub fn is_eog(&self, id: TokenId) -> bool {
        id == self.eos_id || self.eot_ids.contains(&id)
    }

    /// Control tokens with non-empty text, as (text, id) pairs.
    pub fn control_tokens(&self) -> impl Iterator<Item = (&str, TokenId)> {
        self.kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == TokenKind::Control)
            .map(|(id, _)| (self.tokens[id].as_str(), id as TokenId))
            .filter(|(text, _)| !text.is_empty())
    }
}
