//! Statement templates and per-record text substitution
//!
//! A [`StatementTemplate`] is the configured `statement` list: SQL text
//! followed by the field references bound to its `?` placeholders, in order.
//!
//! ## Substitution
//!
//! [`sprintf`] expands references inside arbitrary text against a record:
//!
//! | Reference | Expands to |
//! |-----------|------------|
//! | `%{field}` | the field rendered as text |
//! | `%{+FORMAT}` | `@timestamp` formatted with a strftime `FORMAT` |
//!
//! References that cannot be resolved are left in place verbatim.

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::fmt::Write;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::types::Record;

/// Pre-compiled regex for `%{...}` references
static REFERENCE_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"%\{([^}]+)\}").expect("reference regex pattern is invalid - this is a bug")
});

/// Check whether text contains a `%{...}` reference
pub fn is_dynamic(text: &str) -> bool {
    REFERENCE_REGEX.is_match(text)
}

/// Expand `%{...}` references in `text` against `record`.
pub fn sprintf<'a>(record: &Record, text: &'a str) -> Cow<'a, str> {
    if !text.contains("%{") {
        return Cow::Borrowed(text);
    }

    REFERENCE_REGEX.replace_all(text, |caps: &regex::Captures| {
        let reference = &caps[1];
        let resolved = match reference.strip_prefix('+') {
            Some(format) => record
                .timestamp()
                .and_then(|ts| format_timestamp(&ts, format)),
            None => record.get(reference).and_then(|v| v.to_text()),
        };
        resolved.unwrap_or_else(|| caps[0].to_string())
    })
}

/// strftime formatting that reports invalid formats instead of panicking
fn format_timestamp(ts: &DateTime<Utc>, format: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", ts.format(format)).ok()?;
    Some(out)
}

/// How the statement text is turned into SQL for each record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementMode {
    /// The template text is used as-is; values only reach the store as bound parameters
    #[default]
    Safe,
    /// The template text is expanded against each record before it is prepared
    Unsafe,
}

impl StatementMode {
    /// Mode from the `unsafeStatement` flag
    pub fn from_unsafe_flag(unsafe_statement: bool) -> Self {
        if unsafe_statement {
            Self::Unsafe
        } else {
            Self::Safe
        }
    }
}

/// SQL text plus the ordered field references bound to its placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementTemplate {
    sql: String,
    fields: Vec<String>,
}

impl StatementTemplate {
    /// Create a template
    pub fn new(sql: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            sql: sql.into(),
            fields,
        }
    }

    /// Build from a `statement` list: first element SQL, the rest field references
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Result<Self> {
        let (sql, fields) = parts
            .split_first()
            .ok_or_else(|| Error::config("statement must contain at least the SQL text"))?;

        if sql.as_ref().trim().is_empty() {
            return Err(Error::config("statement SQL text must not be empty"));
        }

        Ok(Self::new(
            sql.as_ref(),
            fields.iter().map(|f| f.as_ref().to_string()).collect(),
        ))
    }

    /// Raw SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Field references, in parameter order (parameter `i + 1` is `fields()[i]`)
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Whether any parameters need binding
    pub fn has_parameters(&self) -> bool {
        !self.fields.is_empty()
    }

    /// SQL to prepare for `record`
    pub fn render<'a>(&'a self, record: &Record, mode: StatementMode) -> Cow<'a, str> {
        match mode {
            StatementMode::Safe => Cow::Borrowed(self.sql.as_str()),
            StatementMode::Unsafe => sprintf(record, &self.sql),
        }
    }
}
