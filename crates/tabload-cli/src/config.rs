//! Configuration file loading
//!
//! Settings come from an INI file with an `[RDS]` section (connection) and
//! an optional `[LOAD]` section (load options):
//!
//! ```ini
//! [RDS]
//! host = db.example.com
//! port = 5432
//! database = warehouse
//! username = loader
//! password = secret
//!
//! [LOAD]
//! chunk_size = 500
//! on_chunk_failure = best-effort
//! ```
//!
//! Environment variables `TABLOAD_RDS__<KEY>` and `TABLOAD_LOAD__<KEY>`
//! override file values. Section and key names are case-insensitive.

use config::{Config, Environment, File, FileFormat};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tabload_common::LoadError;
use tabload_ingest::connection::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_STATEMENT_TIMEOUT_SECS};
use tabload_ingest::{ConnectionDescriptor, FailurePolicy, LoadOptions, SourceEncoding, SslMode};

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config.ini";

const ENV_PREFIX: &str = "TABLOAD";

/// Resolved settings for one invocation
#[derive(Debug, Clone)]
pub struct Settings {
    pub connection: ConnectionDescriptor,
    pub load: LoadOptions,
}

impl Settings {
    /// Read `path`, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let mut values = read_file(path)?;
        let env = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| LoadError::configuration(format!("environment: {}", e)))?;
        values.extend(flatten(env)?);
        Self::from_values(&values)
    }

    /// Read `path` only, ignoring the environment
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        Self::from_values(&read_file(path)?)
    }

    fn from_values(values: &Values) -> Result<Self, LoadError> {
        let rds = Section::new(values, "rds");
        let mut connection = ConnectionDescriptor::new(
            rds.required("host")?,
            rds.required_parsed::<u16>("port")?,
            rds.required("database")?,
            rds.required("username")?,
            rds.required("password")?,
        )
        .with_connect_timeout_secs(
            rds.parsed("connect_timeout_secs")?
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
        .with_statement_timeout_secs(
            rds.parsed("statement_timeout_secs")?
                .unwrap_or(DEFAULT_STATEMENT_TIMEOUT_SECS),
        );
        if let Some(ssl_mode) = rds.parsed::<SslMode>("ssl_mode")? {
            connection = connection.with_ssl_mode(ssl_mode);
        }

        let load = Section::new(values, "load");
        let mut options = LoadOptions::default();
        if let Some(chunk_size) = load.parsed("chunk_size")? {
            options.chunk_size = chunk_size;
        }
        if let Some(retry_limit) = load.parsed("retry_limit")? {
            options.retry_limit = retry_limit;
        }
        if let Some(policy) = load.parsed::<FailurePolicy>("on_chunk_failure")? {
            options.on_chunk_failure = policy;
        }
        if let Some(create) = load.flag("create_table_if_missing")? {
            options.create_table_if_missing = create;
        }
        if let Some(allow_empty) = load.flag("allow_empty")? {
            options.source.allow_empty = allow_empty;
        }
        if let Some(raw) = load.get("delimiter") {
            options.source.delimiter =
                Some(parse_delimiter(raw).map_err(|e| load.invalid("delimiter", e))?);
        }
        if let Some(encoding) = load.parsed::<SourceEncoding>("encoding")? {
            options.source.encoding = Some(encoding);
        }
        if let Some(sample_rows) = load.parsed("sample_rows")? {
            options.source.sample_rows = sample_rows;
        }
        if let Some(ms) = load.parsed::<u64>("retry_backoff_ms")? {
            options.retry_backoff = Duration::from_millis(ms);
        }

        connection.validate()?;
        options.validate()?;
        Ok(Self {
            connection,
            load: options,
        })
    }
}

/// Parse a delimiter: a single character or one of `comma`, `semicolon`,
/// `tab` (also `\t`) and `pipe`
///
/// The names matter in INI files, where a bare `;` starts a comment.
pub fn parse_delimiter(raw: &str) -> Result<char, String> {
    match raw.to_lowercase().as_str() {
        "comma" => return Ok(','),
        "semicolon" => return Ok(';'),
        "tab" | "\\t" => return Ok('\t'),
        "pipe" => return Ok('|'),
        _ => {}
    }
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() && !matches!(c, '"' | '\n' | '\r') => Ok(c),
        _ => Err(format!("'{}' is not a single ASCII delimiter character", raw)),
    }
}

/// `section.key` (lowercase) to raw string value
type Values = BTreeMap<String, String>;

fn read_file(path: &Path) -> Result<Values, LoadError> {
    let file = Config::builder()
        .add_source(File::from(path).format(FileFormat::Ini).required(true))
        .build()
        .map_err(|e| {
            LoadError::configuration(format!(
                "cannot read config file {}: {}",
                path.display(),
                e
            ))
        })?;
    flatten(file)
}

/// Lowercase every `section.key` so file and environment keys line up
fn flatten(source: Config) -> Result<Values, LoadError> {
    let sections: HashMap<String, config::Value> = source
        .try_deserialize()
        .map_err(|e| LoadError::configuration(e.to_string()))?;

    let mut values = Values::new();
    for (section, value) in sections {
        // Top-level scalars (e.g. TABLOAD_CONFIG) are not settings
        let Ok(table) = value.into_table() else {
            continue;
        };
        for (key, value) in table {
            let text = value.into_string().map_err(|e| {
                LoadError::configuration(format!("{}.{}: {}", section, key, e))
            })?;
            values.insert(
                format!("{}.{}", section.to_lowercase(), key.to_lowercase()),
                text,
            );
        }
    }
    Ok(values)
}

struct Section<'a> {
    values: &'a Values,
    name: &'static str,
}

impl<'a> Section<'a> {
    fn new(values: &'a Values, name: &'static str) -> Self {
        Self { values, name }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.values
            .get(&format!("{}.{}", self.name, key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn invalid(&self, key: &str, reason: impl Display) -> LoadError {
        LoadError::configuration(format!(
            "{}.{}: {}",
            self.name.to_uppercase(),
            key,
            reason
        ))
    }

    fn required(&self, key: &str) -> Result<String, LoadError> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| self.invalid(key, "required setting is missing or empty"))
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, LoadError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|raw| raw.parse::<T>().map_err(|e| self.invalid(key, e)))
            .transpose()
    }

    fn required_parsed<T>(&self, key: &str) -> Result<T, LoadError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.parsed(key)?
            .ok_or_else(|| self.invalid(key, "required setting is missing or empty"))
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, LoadError> {
        self.get(key)
            .map(|raw| match raw.to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                other => Err(self.invalid(key, format!("'{}' is not a boolean", other))),
            })
            .transpose()
    }
}
