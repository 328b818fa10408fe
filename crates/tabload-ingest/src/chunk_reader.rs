//! Pull-based chunk production
//!
//! [`ChunkReader`] is an [`Iterator`] of bounded row batches. Nothing is
//! read ahead: each call to `next` parses at most `chunk_size` records, so
//! memory use follows the chunk size rather than the file size. The
//! sequence is single-pass; reading the file again means opening a new
//! reader.

use std::fs::File;
use thiserror::Error;

use tabload_common::{LoadError, ValidationError};

use crate::source::{decode_record, open_csv_reader, Row, SourceDescriptor, SourceEncoding};

/// A bounded batch of rows processed as one transactional unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based position of the chunk in the source
    pub index: usize,
    /// Source line of the first row
    pub first_line: u64,
    pub rows: Vec<Row>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A chunk the reader could not produce
///
/// Non-fatal errors reject only this chunk; the records it spanned have
/// been consumed and the next call continues after them. A fatal error
/// ends the sequence.
#[derive(Debug, Clone, Error)]
#[error("chunk {chunk_index} rejected: {error}")]
pub struct ChunkReadError {
    pub chunk_index: usize,
    /// Records consumed for the rejected chunk
    pub rows: usize,
    #[source]
    pub error: ValidationError,
    pub fatal: bool,
}

/// Lazy, finite sequence of [`Chunk`]s over a validated source
pub struct ChunkReader {
    reader: csv::Reader<File>,
    encoding: SourceEncoding,
    expected_columns: usize,
    chunk_size: usize,
    next_index: usize,
    record: csv::ByteRecord,
    finished: bool,
}

impl ChunkReader {
    /// Open `descriptor.path` from the start, positioned after the header
    pub fn open(
        descriptor: &SourceDescriptor,
        expected_columns: usize,
        chunk_size: usize,
    ) -> Result<Self, LoadError> {
        if chunk_size == 0 {
            return Err(LoadError::configuration("chunk_size must be at least 1"));
        }
        let reader = open_csv_reader(descriptor)?;
        Ok(Self {
            reader,
            encoding: descriptor.encoding,
            expected_columns,
            chunk_size,
            next_index: 1,
            record: csv::ByteRecord::new(),
            finished: false,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Chunk, ChunkReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let index = self.next_index;
        let mut rows = Vec::with_capacity(self.chunk_size);
        let mut consumed = 0;
        let mut first_line = 0;
        let mut rejected: Option<ValidationError> = None;

        while consumed < self.chunk_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => {}
                Ok(false) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(ChunkReadError {
                        chunk_index: index,
                        rows: consumed,
                        error: ValidationError::Malformed(e.to_string()),
                        fatal: true,
                    }));
                }
            }

            let line = self.record.position().map(|p| p.line()).unwrap_or(0);
            if consumed == 0 {
                first_line = line;
            }
            consumed += 1;

            // Keep consuming so the next chunk starts at the right record
            if rejected.is_some() {
                continue;
            }
            if self.record.len() != self.expected_columns {
                rejected = Some(ValidationError::FieldCount {
                    line,
                    expected: self.expected_columns,
                    found: self.record.len(),
                });
                continue;
            }
            match decode_record(&self.record, self.encoding, line, false) {
                Ok(row) => rows.push(row),
                Err(e) => rejected = Some(e),
            }
        }

        if consumed == 0 {
            return None;
        }
        self.next_index += 1;

        Some(match rejected {
            Some(error) => Err(ChunkReadError {
                chunk_index: index,
                rows: consumed,
                error,
                fatal: false,
            }),
            None => Ok(Chunk {
                index,
                first_line,
                rows,
            }),
        })
    }
}
