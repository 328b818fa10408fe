//! Column type inference from a bounded sample
//!
//! Each column walks a small closed lattice as values are observed:
//!
//! ```text
//! Unknown ──> Integer ──> Numeric ──┐
//!    │                              ├──> Text
//!    └──────> Date ─────────────────┘
//! ```
//!
//! Empty values never move a column. A column that saw no value at all
//! ends as `Text`, the widest type.

use chrono::NaiveDate;
use serde::Serialize;

use crate::source::Row;

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

/// Inferred column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Numeric,
    Date,
    Text,
}

impl ColumnType {
    /// SQL type used when the loader creates the target table
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer => "BIGINT",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Date => "DATE",
            ColumnType::Text => "TEXT",
        }
    }

    /// Narrowest type that describes a single non-empty value
    pub fn of_value(value: &str) -> ColumnType {
        let value = value.trim();
        if value.is_empty() || has_significant_leading_zero(value) {
            return ColumnType::Text;
        }
        if value.parse::<i64>().is_ok() {
            return ColumnType::Integer;
        }
        if value.chars().any(|c| c.is_ascii_digit())
            && value.parse::<f64>().map(f64::is_finite).unwrap_or(false)
        {
            return ColumnType::Numeric;
        }
        if DATE_FORMATS
            .iter()
            .any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok())
        {
            return ColumnType::Date;
        }
        ColumnType::Text
    }

    /// Least upper bound of two observations
    pub fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Numeric) | (Numeric, Integer) => Numeric,
            _ => Text,
        }
    }
}

/// Codes such as "007" or "01234" lose information as numbers
fn has_significant_leading_zero(value: &str) -> bool {
    let digits = value.trim_start_matches(['+', '-']);
    let bytes = digits.as_bytes();
    bytes.len() > 1 && bytes[0] == b'0' && bytes[1].is_ascii_digit()
}

/// Streaming inference over rows
#[derive(Debug, Clone)]
pub struct TypeInference {
    states: Vec<Option<ColumnType>>,
}

impl TypeInference {
    pub fn new(columns: usize) -> Self {
        Self {
            states: vec![None; columns],
        }
    }

    /// Fold one row into the per-column state; extra fields are ignored
    pub fn observe(&mut self, row: &Row) {
        for (state, value) in self.states.iter_mut().zip(row) {
            let Some(value) = value.as_deref() else {
                continue;
            };
            let observed = ColumnType::of_value(value);
            *state = Some(match *state {
                None => observed,
                Some(current) => current.widen(observed),
            });
        }
    }

    pub fn finish(self) -> Vec<ColumnType> {
        self.states
            .into_iter()
            .map(|s| s.unwrap_or(ColumnType::Text))
            .collect()
    }
}

/// Infer one type per column from `rows`
pub fn infer_column_types(columns: usize, rows: &[Row]) -> Vec<ColumnType> {
    let mut inference = TypeInference::new(columns);
    for row in rows {
        inference.observe(row);
    }
    inference.finish()
}
