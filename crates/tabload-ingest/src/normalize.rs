//! Header normalization
//!
//! Maps raw header names to database-safe identifiers:
//!
//! 1. trim surrounding whitespace
//! 2. lowercase
//! 3. replace every run of non-alphanumeric characters with one `_`
//! 4. prefix `col_` when the result is empty or starts with a digit
//! 5. cap the length at PostgreSQL's identifier limit
//!
//! Applying the rules to an already normalized name returns it unchanged,
//! so re-running a load over the same file always targets the same columns.

use serde::Serialize;
use std::collections::HashMap;

use tabload_common::ValidationError;

use crate::infer::ColumnType;

/// PostgreSQL truncates identifiers longer than this many bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// One source column: raw header, database name and inferred type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub original: String,
    pub name: String,
    pub column_type: ColumnType,
}

/// Ordered column mapping for a load, positionally aligned with each row
///
/// Normalized names are unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMapping {
    columns: Vec<ColumnSpec>,
}

impl ColumnMapping {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter()
    }

    /// Normalized names in source order
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Replace inferred types; `types` is positionally aligned
    pub fn with_types(mut self, types: &[ColumnType]) -> Self {
        for (column, column_type) in self.columns.iter_mut().zip(types) {
            column.column_type = *column_type;
        }
        self
    }
}

/// Normalize a single header name
pub fn normalize_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator {
                name.push('_');
                pending_separator = false;
            }
            name.push(c.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    if pending_separator {
        name.push('_');
    }

    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "col_");
    }
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

/// Build the column mapping for a header row
///
/// Types default to `Text` until inference runs. Fails when two headers
/// normalize to the same name; no column is ever dropped silently.
pub fn normalize<S: AsRef<str>>(raw_headers: &[S]) -> Result<ColumnMapping, ValidationError> {
    let mut seen: HashMap<String, &str> = HashMap::with_capacity(raw_headers.len());
    let mut columns = Vec::with_capacity(raw_headers.len());

    for raw in raw_headers {
        let raw = raw.as_ref();
        let name = normalize_name(raw);
        if let Some(first) = seen.get(&name) {
            return Err(ValidationError::ColumnCollision {
                first: first.to_string(),
                second: raw.to_string(),
                normalized: name,
            });
        }
        seen.insert(name.clone(), raw);
        columns.push(ColumnSpec {
            original: raw.to_string(),
            name,
            column_type: ColumnType::Text,
        });
    }

    Ok(ColumnMapping { columns })
}
