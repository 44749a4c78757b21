use std::io::{Cursor, Read};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{ModelError, Result};

/// The four-byte magic identifying a precomputed embedding block: ASCII "MMEB".
pub const EMBED_MAGIC: [u8; 4] = *b"MMEB";

/// Container version written and accepted by this crate.
pub const EMBED_VERSION: u32 = 1;

/// Size of the fixed header: magic, version, dtype, n_positions, embed_dim.
pub const EMBED_HEADER_LEN: usize = 20;

/// A block of dense vectors produced by an image encoder, injected into the
/// model input in place of token embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEmbed {
    data: Vec<f32>,
    n_positions: usize,
    embed_dim: usize,
}

impl ImageEmbed {
    /// Wrap `data` laid out as `[n_positions, embed_dim]` row-major.
    pub fn new(data: Vec<f32>, n_positions: usize, embed_dim: usize) -> Result<Self> {
        if embed_dim == 0 {
            return Err(ModelError::Other("embedding dimension must be non-zero".to_string()));
        }
        let expected = n_positions
            .checked_mul(embed_dim)
            .ok_or(ModelError::SizeOverflow {
                n_positions,
                embed_dim,
            })?;
        if data.len() != expected {
            return Err(ModelError::DimensionMismatch {
                expected,
                got: data.len(),
            });
        }
        Ok(ImageEmbed {
            data,
            n_positions,
            embed_dim,
        })
    }

    /// All vectors, flattened.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Number of embedding positions (slots) the block occupies.
    pub fn n_positions(&self) -> usize {
        self.n_positions
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// The vector at position `i`, if in range.
    pub fn position(&self, i: usize) -> Option<&[f32]> {
        if i >= self.n_positions {
            return None;
        }
        let start = i * self.embed_dim;
        Some(&self.data[start..start + self.embed_dim])
    }
}

/// Where an image comes from.
#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    Bytes(&'a [u8]),
    Path(&'a Path),
}

/// Turns an image into an embedding block.
///
/// The vision encoder itself lives outside this workspace; implementations
/// wrap whatever produces the vectors.
pub trait ImageEncoder {
    fn embed_image(&self, source: ImageSource<'_>) -> Result<ImageEmbed>;
}

/// Element type of a serialized embedding block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedDType {
    F32,
    F16,
}

impl EmbedDType {
    pub fn from_id(id: u32) -> Option<EmbedDType> {
        match id {
            0 => Some(EmbedDType::F32),
            1 => Some(EmbedDType::F16),
            _ => None,
        }
    }

    pub fn id(self) -> u32 {
        match self {
            EmbedDType::F32 => 0,
            EmbedDType::F16 => 1,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            EmbedDType::F32 => 4,
            EmbedDType::F16 => 2,
        }
    }
}

/// Parsed header of a serialized embedding block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedHeader {
    pub version: u32,
    pub dtype: EmbedDType,
    pub n_positions: u32,
    pub embed_dim: u32,
}

impl EmbedHeader {
    /// Parse the header from the beginning of a reader.
    ///
    /// Reads and validates the 4-byte magic, then version, dtype id,
    /// position count and dimension, each a u32 LE.
    pub fn parse(reader: &mut impl Read) -> Result<EmbedHeader> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != EMBED_MAGIC {
            return Err(ModelError::InvalidMagic(magic));
        }

        let version = read_u32(reader)?;
        if version != EMBED_VERSION {
            return Err(ModelError::UnsupportedVersion(version));
        }

        let dtype_id = read_u32(reader)?;
        let dtype = EmbedDType::from_id(dtype_id).ok_or(ModelError::UnsupportedDType(dtype_id))?;

        let n_positions = read_u32(reader)?;
        let embed_dim = read_u32(reader)?;

        Ok(EmbedHeader {
            version,
            dtype,
            n_positions,
            embed_dim,
        })
    }

    /// Payload size in bytes implied by this header.
    pub fn payload_len(&self) -> Result<usize> {
        let n_positions = self.n_positions as usize;
        let embed_dim = self.embed_dim as usize;
        n_positions
            .checked_mul(embed_dim)
            .and_then(|n| n.checked_mul(self.dtype.size_in_bytes()))
            .ok_or(ModelError::SizeOverflow {
                n_positions,
                embed_dim,
            })
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf4 = [0u8; 4];
    reader.read_exact(&mut buf4)?;
    Ok(u32::from_le_bytes(buf4))
}

/// Parse a complete serialized embedding block.
pub fn parse_embed_block(bytes: &[u8]) -> Result<ImageEmbed> {
    let mut reader = Cursor::new(bytes);
    let header = EmbedHeader::parse(&mut reader)?;

    let payload = &bytes[EMBED_HEADER_LEN..];
    let expected = header.payload_len()?;
    if payload.len() != expected {
        return Err(ModelError::Truncated {
            expected,
            got: payload.len(),
        });
    }

    let data: Vec<f32> = match header.dtype {
        EmbedDType::F32 => payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        EmbedDType::F16 => payload
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
    };

    ImageEmbed::new(data, header.n_positions as usize, header.embed_dim as usize)
}

/// Serialize an embedding block. F16 output rounds each value.
pub fn write_embed_block(embed: &ImageEmbed, dtype: EmbedDType) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(EMBED_HEADER_LEN + embed.data.len() * dtype.size_in_bytes());
    out.extend_from_slice(&EMBED_MAGIC);
    out.extend_from_slice(&EMBED_VERSION.to_le_bytes());
    out.extend_from_slice(&dtype.id().to_le_bytes());
    out.extend_from_slice(&(embed.n_positions as u32).to_le_bytes());
    out.extend_from_slice(&(embed.embed_dim as u32).to_le_bytes());
    for &v in &embed.data {
        match dtype {
            EmbedDType::F32 => out.extend_from_slice(&v.to_le_bytes()),
            EmbedDType::F16 => out.extend_from_slice(&half::f16::from_f32(v).to_le_bytes()),
        }
    }
    out
}

/// Image encoder for blocks that were encoded ahead of time and stored in
/// the `MMEB` container, either in memory or on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrecomputedEmbeds;

impl ImageEncoder for PrecomputedEmbeds {
    fn embed_image(&self, source: ImageSource<'_>) -> Result<ImageEmbed> {
        match source {
            ImageSource::Bytes(bytes) => parse_embed_block(bytes),
            ImageSource::Path(path) => {
                let file = std::fs::File::open(path)?;
                let mmap = unsafe { Mmap::map(&file)? };
                parse_embed_block(&mmap)
            }
        }
    }
}
