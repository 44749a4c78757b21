use mm_model::TokenId;
use tracing::trace;

use crate::error::{EngineError, Result};
use crate::runtime::ModelRuntime;

/// Longest undecodable tail tolerated before the stream is declared
/// malformed: one full 4-byte UTF-8 sequence.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 4;

/// Result of scanning a byte buffer as UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Scan {
    /// Every sequence is complete.
    Complete,
    /// The buffer ends inside a sequence; `tail` bytes from its lead byte on.
    Incomplete { tail: usize },
    /// A bad lead or continuation byte; `tail` bytes from the defective
    /// sequence's lead byte on.
    Malformed { tail: usize },
}

/// Scan `bytes` by UTF-8 lead-byte lengths.
///
/// Lead `0xxxxxxx` is 1 byte, `110xxxxx` 2, `1110xxxx` 3, `11110xxx` 4;
/// every other lead byte is malformed. Each continuation must be `10xxxxxx`.
pub fn scan_utf8(bytes: &[u8]) -> Utf8Scan {
    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        let len = if lead & 0x80 == 0x00 {
            1
        } else if lead & 0xE0 == 0xC0 {
            2
        } else if lead & 0xF0 == 0xE0 {
            3
        } else if lead & 0xF8 == 0xF0 {
            4
        } else {
            return Utf8Scan::Malformed { tail: bytes.len() - i };
        };
        for k in 1..len {
            match bytes.get(i + k) {
                None => return Utf8Scan::Incomplete { tail: bytes.len() - i },
                Some(b) if b & 0xC0 != 0x80 => {
                    return Utf8Scan::Malformed { tail: bytes.len() - i }
                }
                Some(_) => {}
            }
        }
        i += len;
    }
    Utf8Scan::Complete
}

/// True if `bytes` is a sequence of complete UTF-8 characters.
pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    scan_utf8(bytes) == Utf8Scan::Complete
}

/// Turns per-token byte pieces into text chunks that are always valid UTF-8.
///
/// Pieces accumulate until the whole buffer decodes, then the buffer is
/// emitted and cleared. Concatenating every emitted chunk gives the decoded
/// byte stream of all accepted tokens, minus whatever is still pending.
#[derive(Debug, Clone)]
pub struct StreamingDetokenizer {
    pending: Vec<u8>,
    max_pending: usize,
}

impl Default for StreamingDetokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_BYTES)
    }
}

impl StreamingDetokenizer {
    pub fn new(max_pending: usize) -> Self {
        StreamingDetokenizer {
            pending: Vec::new(),
            max_pending,
        }
    }

    /// Look up the piece of `token_id` and accept it.
    pub fn accept<R: ModelRuntime + ?Sized>(
        &mut self,
        runtime: &R,
        token_id: TokenId,
    ) -> Result<String> {
        let piece = runtime.token_to_piece(token_id)?;
        self.accept_piece(token_id, &piece)
    }

    /// Append a piece. Returns the decoded chunk, or an empty string while
    /// bytes are still buffered.
    ///
    /// Fails with `MalformedTokenStream` once the undecodable tail is longer
    /// than `max_pending` bytes, or when the buffer scans complete but is not
    /// a legal encoding (overlong form, surrogate).
    pub fn accept_piece(&mut self, token_id: TokenId, piece: &[u8]) -> Result<String> {
        self.pending.extend_from_slice(piece);

        match scan_utf8(&self.pending) {
            Utf8Scan::Complete => {
                let bytes = std::mem::take(&mut self.pending);
                String::from_utf8(bytes).map_err(|e| {
                    let pending = e.as_bytes().len();
                    EngineError::MalformedTokenStream { token_id, pending }
                })
            }
            Utf8Scan::Incomplete { tail } | Utf8Scan::Malformed { tail } => {
                if tail > self.max_pending {
                    return Err(EngineError::MalformedTokenStream {
                        token_id,
                        pending: tail,
                    });
                }
                trace!(token_id, pending = self.pending.len(), "buffering partial UTF-8");
                Ok(String::new())
            }
        }
    }

    /// Bytes accepted but not yet emitted.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Remove and return the pending bytes.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
