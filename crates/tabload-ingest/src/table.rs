//! Target table naming and column resolution

use std::fmt;

use tabload_common::{DatabaseError, LoadError};

use crate::normalize::ColumnMapping;

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Optionally schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    /// Parse `table` or `schema.table`
    pub fn parse(raw: &str) -> Result<Self, LoadError> {
        let parts: Vec<&str> = raw.trim().split('.').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(LoadError::configuration(format!(
                "invalid table name '{}'",
                raw
            )));
        }
        match parts.as_slice() {
            [name] => Ok(Self {
                schema: None,
                name: name.to_string(),
            }),
            [schema, name] => Ok(Self {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            }),
            _ => Err(LoadError::configuration(format!(
                "invalid table name '{}': expected 'table' or 'schema.table'",
                raw
            ))),
        }
    }

    /// Quoted form for use in SQL text and `to_regclass`
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Column as written to the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: String,
    /// Base SQL type without length or precision; bound text values are
    /// cast to it and the column assignment enforces the modifiers
    pub sql_type: String,
}

/// Resolved insert target, positionally aligned with the column mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub table: TableName,
    pub columns: Vec<TargetColumn>,
}

impl TableTarget {
    /// Target using the inferred types, as for a table the loader creates
    pub fn from_mapping(table: TableName, mapping: &ColumnMapping) -> Self {
        let columns = mapping
            .iter()
            .map(|c| TargetColumn {
                name: c.name.clone(),
                sql_type: c.column_type.sql_type().to_string(),
            })
            .collect();
        Self { table, columns }
    }

    /// Match the mapping against `(column, type)` pairs read from the catalog
    ///
    /// Every mapped column must exist. Extra table columns are left to their
    /// defaults.
    pub fn resolve(
        table: TableName,
        mapping: &ColumnMapping,
        catalog: &[(String, String)],
    ) -> Result<Self, DatabaseError> {
        let mut columns = Vec::with_capacity(mapping.len());
        let mut missing = Vec::new();

        for spec in mapping.iter() {
            match catalog.iter().find(|(name, _)| *name == spec.name) {
                Some((name, sql_type)) => columns.push(TargetColumn {
                    name: name.clone(),
                    sql_type: sql_type.clone(),
                }),
                None => missing.push(spec.name.as_str()),
            }
        }

        if !missing.is_empty() {
            return Err(DatabaseError::schema_mismatch(format!(
                "table {} has no column(s): {}",
                table,
                missing.join(", ")
            )));
        }
        Ok(Self { table, columns })
    }

    pub fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table.quoted(),
            columns.join(", ")
        )
    }

    /// `INSERT INTO ... (cols) ` prefix for a multi-row VALUES list
    pub fn insert_prefix(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(&c.name)).collect();
        format!(
            "INSERT INTO {} ({}) ",
            self.table.quoted(),
            columns.join(", ")
        )
    }
}
