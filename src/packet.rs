//! Packet disassembly and order-independent reassembly.
//!
//! `disassemble` is a pure function of its input: the same payload and chunk
//! size always produce the same ordered chunk sequence. Reassembly buffers
//! chunks by sequence index and is a non-blocking query over whatever has
//! arrived so far; the caller decides whether to go back to the bus for the
//! missing indices.

use std::collections::BTreeMap;
use thiserror::Error;

/// One bounded-size slice of a larger payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub index: u16,
    pub total: u16,
    pub payload: Vec<u8>,
}

/// Splits `bytes` into `ceil(len / chunk_size)` chunks. The last chunk is
/// short and never padded here; padding is the frame codec's business.
///
/// A zero-length payload yields a single empty chunk so completeness stays
/// decidable on the receiving side.
pub fn disassemble(bytes: &[u8], chunk_size: usize) -> Result<Vec<DataChunk>, AssemblyError> {
    if chunk_size == 0 {
        return Err(AssemblyError::InvalidChunkSize);
    }

    if bytes.is_empty() {
        return Ok(vec![DataChunk {
            index: 0,
            total: 1,
            payload: Vec::new(),
        }]);
    }

    let count = bytes.len().div_ceil(chunk_size);
    if count > u16::MAX as usize {
        return Err(AssemblyError::TooManyChunks { chunks: count });
    }

    let total = count as u16;
    Ok(bytes
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, piece)| DataChunk {
            index: i as u16,
            total,
            payload: piece.to_vec(),
        })
        .collect())
}

/// Buffers chunks of one image as they arrive, in any order.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    total: Option<u16>,
    chunks: BTreeMap<u16, Vec<u8>>,
    poisoned: bool,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts one received chunk. The total-count is fixed by the first
    /// chunk that passes validation; any later chunk disagreeing poisons the
    /// whole sequence, which is a hard failure rather than something we try
    /// to reconcile. A rejected chunk leaves the buffered state untouched.
    pub fn offer(&mut self, chunk: DataChunk) -> Result<(), AssemblyError> {
        if self.poisoned {
            return Err(AssemblyError::TotalMismatch);
        }

        if chunk.index >= chunk.total {
            return Err(AssemblyError::IndexOutOfRange {
                index: chunk.index,
                total: chunk.total,
            });
        }

        match self.total {
            None => self.total = Some(chunk.total),
            Some(total) if total != chunk.total => {
                self.poisoned = true;
                return Err(AssemblyError::TotalMismatch);
            }
            Some(_) => {}
        }

        // First payload wins; duplicates are harmless.
        self.chunks.entry(chunk.index).or_insert(chunk.payload);
        Ok(())
    }

    /// Number of distinct chunks received so far.
    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// Total-count fixed by the first chunk, if any chunk has arrived.
    pub fn total(&self) -> Option<u16> {
        self.total
    }

    /// Indices still outstanding, in ascending order.
    pub fn missing_indices(&self) -> Vec<u16> {
        match self.total {
            None => Vec::new(),
            Some(total) => (0..total).filter(|i| !self.chunks.contains_key(i)).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.chunks.len() == total as usize) && !self.poisoned
    }

    /// Non-blocking query: reassembles the payload iff every index in
    /// `0..total` has been received. Never consumes the buffered chunks.
    pub fn assemble(&self) -> Result<Vec<u8>, AssemblyError> {
        if self.poisoned {
            return Err(AssemblyError::TotalMismatch);
        }
        let total = self.total.ok_or(AssemblyError::Empty)?;

        let missing = self.missing_indices();
        if !missing.is_empty() {
            return Err(AssemblyError::Incomplete { missing });
        }

        let mut out = Vec::with_capacity(self.chunks.values().map(Vec::len).sum());
        for index in 0..total {
            out.extend_from_slice(&self.chunks[&index]);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("no chunks received")]
    Empty,
    #[error("chunk size must be nonzero")]
    InvalidChunkSize,
    #[error("payload needs {chunks} chunks, over the sequence index limit")]
    TooManyChunks { chunks: usize },
    #[error("chunk index {index} outside total-count {total}")]
    IndexOutOfRange { index: u16, total: u16 },
    #[error("total-count changed mid-sequence")]
    TotalMismatch,
    #[error("reassembly incomplete, {} chunk(s) missing", missing.len())]
    Incomplete { missing: Vec<u16> },
}
