//! Pre-load structural validation of a source file
//!
//! The validator is a read-only pass: it inspects the header and a bounded
//! sample of data rows, then closes the file. The chunk reader opens the
//! path again from the start, so nothing downstream depends on where the
//! scan stopped.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use tracing::{debug, warn};

use tabload_common::ValidationError;

use crate::source::{
    decode_record, open_csv_reader, sniff_delimiter, Row, SourceDescriptor, SourceEncoding,
    SourceOptions,
};

/// Bytes read up front for delimiter and encoding detection
const DETECTION_PREFIX_BYTES: u64 = 64 * 1024;

/// Outcome of a successful validation
#[derive(Debug, Clone)]
pub struct ValidatedSource {
    pub descriptor: SourceDescriptor,
    /// Raw header names, BOM stripped, in source order
    pub headers: Vec<String>,
    /// Well-formed rows from the sampled prefix, used for type inference
    pub sample: Vec<Row>,
    /// Lines in the sample whose field count disagrees with the header
    ///
    /// Reported, not fatal: the chunk containing such a row is rejected at
    /// load time.
    pub skewed_lines: Vec<u64>,
}

/// Source validator
#[derive(Debug, Clone, Default)]
pub struct Validator {
    options: SourceOptions,
}

impl Validator {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }

    /// Validate `path` without touching the database
    pub fn validate(&self, path: &Path) -> Result<ValidatedSource, ValidationError> {
        let shown = path.display().to_string();

        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ValidationError::NotFound(shown.clone()),
            _ => ValidationError::Unreadable {
                path: shown.clone(),
                reason: e.to_string(),
            },
        })?;
        if metadata.is_dir() {
            return Err(ValidationError::Unreadable {
                path: shown,
                reason: "is a directory".to_string(),
            });
        }
        if metadata.len() == 0 {
            return Err(ValidationError::Empty(shown));
        }

        let prefix = read_prefix(path).map_err(|e| ValidationError::Unreadable {
            path: shown.clone(),
            reason: e.to_string(),
        })?;
        let encoding = self
            .options
            .encoding
            .unwrap_or_else(|| SourceEncoding::detect(&prefix));
        let delimiter = self
            .options
            .delimiter
            .unwrap_or_else(|| sniff_delimiter(&prefix));
        if !delimiter.is_ascii() {
            return Err(ValidationError::Malformed(format!(
                "delimiter {:?} is not a single-byte character",
                delimiter
            )));
        }

        let mut descriptor = SourceDescriptor {
            path: path.to_path_buf(),
            delimiter,
            encoding,
            row_count: None,
        };

        let mut reader = open_csv_reader(&descriptor)?;
        let header_record = reader
            .byte_headers()
            .map_err(|e| csv_error(&shown, e))?
            .clone();
        let headers: Vec<String> = decode_record(&header_record, encoding, 1, true)?
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect();
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(ValidationError::MissingHeader(shown));
        }

        let mut sample = Vec::new();
        let mut skewed_lines = Vec::new();
        let mut rows_read: u64 = 0;
        let mut reached_eof = false;
        let mut record = csv::ByteRecord::new();

        while (rows_read as usize) < self.options.sample_rows {
            let more = reader
                .read_byte_record(&mut record)
                .map_err(|e| csv_error(&shown, e))?;
            if !more {
                reached_eof = true;
                break;
            }
            rows_read += 1;

            let line = record.position().map(|p| p.line()).unwrap_or(rows_read + 1);
            if record.len() != headers.len() {
                warn!(
                    path = %shown,
                    line,
                    expected = headers.len(),
                    found = record.len(),
                    "Field count differs from header; the chunk holding this row will be rejected"
                );
                skewed_lines.push(line);
                continue;
            }
            sample.push(decode_record(&record, encoding, line, false)?);
        }

        if !reached_eof {
            // The sample may have ended exactly at the last row
            reached_eof = !reader
                .read_byte_record(&mut record)
                .map_err(|e| csv_error(&shown, e))?;
        }
        if reached_eof {
            descriptor.row_count = Some(rows_read);
        }

        if rows_read == 0 && !self.options.allow_empty {
            return Err(ValidationError::NoDataRows(shown));
        }

        debug!(
            path = %shown,
            delimiter = ?descriptor.delimiter,
            encoding = %descriptor.encoding,
            columns = headers.len(),
            sampled = rows_read,
            row_count = ?descriptor.row_count,
            "Source validated"
        );

        Ok(ValidatedSource {
            descriptor,
            headers,
            sample,
            skewed_lines,
        })
    }
}

fn read_prefix(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut prefix = Vec::new();
    File::open(path)?
        .take(DETECTION_PREFIX_BYTES)
        .read_to_end(&mut prefix)?;
    Ok(prefix)
}

fn csv_error(path: &str, err: csv::Error) -> ValidationError {
    if err.is_io_error() {
        ValidationError::Unreadable {
            path: path.to_string(),
            reason: err.to_string(),
        }
    } else {
        ValidationError::Malformed(format!("{}: {}", path, err))
    }
}
