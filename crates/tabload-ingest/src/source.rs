//! Source file description: delimiter, encoding and decoding helpers

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::PathBuf;

use tabload_common::ValidationError;

/// Default number of data rows the validator samples
pub const DEFAULT_SAMPLE_ROWS: usize = 100;

/// Delimiters tried when none is configured, in tie-break order
pub const CANDIDATE_DELIMITERS: [char; 4] = [',', ';', '\t', '|'];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A single decoded row; empty fields are `None`
pub type Row = Vec<Option<String>>;

/// Text encoding of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SourceEncoding {
    #[default]
    Utf8,
    /// ISO-8859-1; every byte maps to the code point of the same value
    Latin1,
}

impl SourceEncoding {
    /// Decode raw field bytes
    pub fn decode<'a>(self, bytes: &'a [u8]) -> Result<Cow<'a, str>, std::str::Utf8Error> {
        match self {
            SourceEncoding::Utf8 => std::str::from_utf8(bytes).map(Cow::Borrowed),
            SourceEncoding::Latin1 => Ok(Cow::Owned(bytes.iter().map(|&b| b as char).collect())),
        }
    }

    /// Pick UTF-8 when the sampled prefix is valid UTF-8, Latin-1 otherwise
    ///
    /// A multi-byte sequence cut off at the end of the prefix still counts
    /// as valid.
    pub fn detect(prefix: &[u8]) -> Self {
        match std::str::from_utf8(prefix) {
            Ok(_) => SourceEncoding::Utf8,
            Err(e) if e.error_len().is_none() => SourceEncoding::Utf8,
            Err(_) => SourceEncoding::Latin1,
        }
    }
}

impl std::str::FromStr for SourceEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(SourceEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(SourceEncoding::Latin1),
            other => Err(format!("unsupported encoding '{}'", other)),
        }
    }
}

impl std::fmt::Display for SourceEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceEncoding::Utf8 => write!(f, "utf-8"),
            SourceEncoding::Latin1 => write!(f, "latin-1"),
        }
    }
}

/// Caller-side source settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOptions {
    /// Field delimiter; `None` sniffs it from the header line
    pub delimiter: Option<char>,
    /// Text encoding; `None` detects it from the sampled prefix
    pub encoding: Option<SourceEncoding>,
    /// Data rows inspected by the validator and used for type inference
    pub sample_rows: usize,
    /// Accept a header-only source as a zero-row load
    pub allow_empty: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            encoding: None,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            allow_empty: false,
        }
    }
}

/// What validation learned about a source file
///
/// Immutable once built; the chunk reader reopens the file from `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDescriptor {
    pub path: PathBuf,
    pub delimiter: char,
    pub encoding: SourceEncoding,
    /// Data row count, known only when the whole file fit in the sample
    pub row_count: Option<u64>,
}

/// Build a CSV reader over `path` configured for `descriptor`
pub(crate) fn open_csv_reader(
    descriptor: &SourceDescriptor,
) -> Result<csv::Reader<std::fs::File>, ValidationError> {
    csv::ReaderBuilder::new()
        .delimiter(descriptor.delimiter as u8)
        .has_headers(true)
        .flexible(true)
        .from_path(&descriptor.path)
        .map_err(|e| ValidationError::Unreadable {
            path: descriptor.path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Guess the delimiter from the first line of the file
///
/// Counts each candidate outside double quotes and takes the most frequent;
/// falls back to a comma when none appears.
pub fn sniff_delimiter(prefix: &[u8]) -> char {
    let prefix = prefix.strip_prefix(UTF8_BOM).unwrap_or(prefix);
    let line_end = prefix
        .iter()
        .position(|&b| b == b'\n' || b == b'\r')
        .unwrap_or(prefix.len());

    let mut counts = [0usize; CANDIDATE_DELIMITERS.len()];
    let mut in_quotes = false;
    for &byte in &prefix[..line_end] {
        if byte == b'"' {
            in_quotes = !in_quotes;
            continue;
        }
        if in_quotes {
            continue;
        }
        if let Some(i) = CANDIDATE_DELIMITERS.iter().position(|&c| c as u8 == byte) {
            counts[i] += 1;
        }
    }

    let mut best = 0;
    for i in 1..counts.len() {
        if counts[i] > counts[best] {
            best = i;
        }
    }
    if counts[best] == 0 {
        ','
    } else {
        CANDIDATE_DELIMITERS[best]
    }
}

/// Decode a record into a [`Row`]
///
/// `strip_bom` removes a leading UTF-8 byte-order mark from the first field.
pub(crate) fn decode_record(
    record: &csv::ByteRecord,
    encoding: SourceEncoding,
    line: u64,
    strip_bom: bool,
) -> Result<Row, ValidationError> {
    record
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let field = if strip_bom && i == 0 {
                field.strip_prefix(UTF8_BOM).unwrap_or(field)
            } else {
                field
            };
            let text = encoding.decode(field).map_err(|e| ValidationError::Encoding {
                line,
                reason: format!("field {} is not valid {}: {}", i + 1, encoding, e),
            })?;
            Ok(if text.is_empty() {
                None
            } else {
                Some(text.into_owned())
            })
        })
        .collect()
}
