use std::collections::HashMap;

use crate::error::{ModelError, Result};
use crate::TokenId;
use super::vocab::{TokenKind, Vocab};

/// Byte-Pair Encoding tokenizer with byte fallback.
///
/// Pieces are returned as raw bytes: a character the vocabulary only knows
/// through `<0xHH>` tokens is split across several tokens, none of which is
/// valid UTF-8 on its own.
pub struct BpeTokenizer {
    /// The token vocabulary (strings, kinds, special token IDs).
    pub vocab: Vocab,
    /// Map from merge pair to priority rank (lower rank = higher priority).
    merge_ranks: HashMap<(String, String), usize>,
}

impl BpeTokenizer {
    /// Build a tokenizer from a vocabulary and ordered merge rules.
    ///
    /// Each merge entry is "left right"; earlier entries have higher priority.
    /// The concatenation of every merge must itself be a vocabulary token.
    pub fn new<S: AsRef<str>>(vocab: Vocab, merges: &[S]) -> Result<BpeTokenizer> {
        let mut merge_ranks = HashMap::with_capacity(merges.len());

        for (rank, entry) in merges.iter().enumerate() {
            let entry = entry.as_ref();
            let (left, right) = entry.split_once(' ').ok_or_else(|| {
                ModelError::TokenizerError(format!("invalid merge entry: {:?}", entry))
            })?;
            let merged = format!("{}{}", left, right);
            if vocab.id_of(&merged).is_none() {
                return Err(ModelError::TokenizerError(format!(
                    "merge {:?} produces {:?}, which is not in the vocabulary",
                    entry, merged
                )));
            }
            merge_ranks
                .entry((left.to_string(), right.to_string()))
                .or_insert(rank);
        }

        Ok(BpeTokenizer { vocab, merge_ranks })
    }

    /// Encode `text` into token ids.
    ///
    /// - `add_bos`: prepend the beginning-of-sequence token.
    /// - `special`: match control-token texts (e.g. `</s>`) appearing in the
    ///   input as their ids instead of tokenizing them as plain text.
    pub fn encode(&self, text: &str, add_bos: bool, special: bool) -> Result<Vec<TokenId>> {
        let mut out = Vec::new();
        if add_bos {
            out.push(self.vocab.bos_id);
        }

        if !special {
            self.encode_fragment(text, &mut out)?;
            return Ok(out);
        }

        let controls: Vec<(&str, TokenId)> = self.vocab.control_tokens().collect();
        let mut rest = text;
        while !rest.is_empty() {
            // Earliest control match; the longest wins at the same offset.
            let mut best: Option<(usize, usize, TokenId)> = None;
            for &(ctl, id) in &controls {
                if let Some(at) = rest.find(ctl) {
                    let better = match best {
                        None => true,
                        Some((b_at, b_len, _)) => at < b_at || (at == b_at && ctl.len() > b_len),
                    };
                    if better {
                        best = Some((at, ctl.len(), id));
                    }
                }
            }
            match best {
                Some((at, len, id)) => {
                    self.encode_fragment(&rest[..at], &mut out)?;
                    out.push(id);
                    rest = &rest[at + len..];
                }
                None => {
                    self.encode_fragment(rest, &mut out)?;
                    break;
                }
            }
        }
        Ok(out)
    }

    /// BPE-encode plain text (no control-token matching) onto `out`.
    fn encode_fragment(&self, text: &str, out: &mut Vec<TokenId>) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }

        // Initial symbols: whole characters where the vocabulary has them,
        // otherwise one byte-fallback token per UTF-8 byte.
        let mut symbols: Vec<String> = Vec::new();
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let ch_str: &str = ch.encode_utf8(&mut buf);
            if self.vocab.id_of(ch_str).is_some() {
                symbols.push(ch_str.to_string());
                continue;
            }
            for byte in ch_str.bytes() {
                let byte_token = format!("<0x{:02X}>", byte);
                if self.vocab.id_of(&byte_token).is_some() {
                    symbols.push(byte_token);
                } else if let Some(unk) = self.vocab.unk_id() {
                    // Represent the whole character once, by its unk text.
                    symbols.push(self.vocab.token(unk).unwrap_or_default().to_string());
                    break;
                } else {
                    return Err(ModelError::TokenizerError(format!(
                        "cannot represent {:?}: no piece, byte token, or unk",
                        ch
                    )));
                }
            }
        }

        // Iteratively apply the highest-priority merge.
        while symbols.len() >= 2 {
            let mut best_rank = usize::MAX;
            let mut best_idx = usize::MAX;

            for i in 0..symbols.len() - 1 {
                let pair = (symbols[i].clone(), symbols[i + 1].clone());
                if let Some(&rank) = self.merge_ranks.get(&pair) {
                    if rank < best_rank {
                        best_rank = rank;
                        best_idx = i;
                    }
                }
            }

            if best_idx == usize::MAX {
                break;
            }

            let right = symbols.remove(best_idx + 1);
            symbols[best_idx].push_str(&right);
        }

        for sym in &symbols {
            let id = self.vocab.id_of(sym).ok_or_else(|| {
                ModelError::TokenizerError(format!("symbol {:?} has no token id", sym))
            })?;
            out.push(id);
        }
        Ok(())
    }

    /// Raw bytes a token contributes to the output stream.
    ///
    /// Byte tokens yield their single byte, which may be an incomplete UTF-8
    /// sequence. Control tokens render as their text.
    pub fn token_to_piece(&self, id: TokenId) -> Result<Vec<u8>> {
        match self.vocab.kind(id) {
            Some(TokenKind::Byte(b)) => Ok(vec![b]),
            Some(_) => Ok(self.vocab.token(id).unwrap_or_default().as_bytes().to_vec()),
            None => Err(ModelError::TokenOutOfRange {
                token_id: id,
                n_vocab: self.vocab.len(),
            }),
        }
    }

    /// Decode token ids into a string, replacing invalid UTF-8 lossily.
    /// Out-of-range ids are skipped.
    pub fn decode(&self, tokens: &[TokenId]) -> String {
        let mut bytes: Vec<u8> = Vec::new();
        for &id in tokens {
            if let Ok(piece) = self.token_to_piece(id) {
                bytes.extend_from_slice(&piece);
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// True for tokens that end generation.
    pub fn is_eog(&self, id: TokenId) -> bool {
        self.vocab.is_eog(id)
    }

    /// Returns the beginning-of-sequence token ID.
    pub fn bos_id(&self) -> TokenId {
        self.vocab.bos_id
    }

    /// Returns the end-of-sequence token ID.
    pub fn eos_id(&self) -> TokenId {
        self.vocab.eos_id
    }

    pub fn n_vocab(&self) -> usize {
        self.vocab.len()
    }
}
