//! SQL statement helpers for database instrumentation.
//!
//! - [`obfuscate_sql`] replaces literals and comments with `?`.
//! - [`extract_operation`] finds the low-cardinality command word.
//! - [`PreparedStatements`] remembers the obfuscated text of prepared
//!   statements by name, in a bounded LRU, so later executions can report it.

use crate::cache::{CacheError, SharedCache};
use crate::span::{AttributeValue, Attributes};
use lazy_static::lazy_static;
use regex::Regex;

/// Statements longer than this many characters are not scanned.
pub const MAX_OBFUSCATION_LENGTH: usize = 2000;

pub const QUERY_TOO_LARGE: &str = "SQL query too large to remove sensitive data ...";
pub const OBFUSCATION_FAILED: &str =
    "Failed to obfuscate SQL query - quote characters remained after obfuscation";

/// PostgreSQL commands, truncated to their first word.
pub const SQL_COMMANDS: &[&str] = &[
    "ABORT", "ALTER", "ANALYZE", "BEGIN", "CALL", "CHECKPOINT", "CLOSE", "CLUSTER", "COMMENT",
    "COMMIT", "COPY", "CREATE", "DEALLOCATE", "DECLARE", "DELETE", "DISCARD", "DO", "DROP", "END",
    "EXECUTE", "EXPLAIN", "FETCH", "GRANT", "IMPORT", "INSERT", "LISTEN", "LOAD", "LOCK", "MOVE",
    "NOTIFY", "PREPARE", "REASSIGN", "REFRESH", "REINDEX", "RELEASE", "RESET", "REVOKE",
    "ROLLBACK", "SAVEPOINT", "SECURITY", "SELECT", "SET", "SHOW", "START", "TRUNCATE", "UNLISTEN",
    "UPDATE", "VACUUM", "VALUES",
];

lazy_static! {
    /// Literals and comments other than quoted strings, in priority order
    static ref LITERALS: Regex = Regex::new(concat!(
        r"\{?(?:[0-9a-fA-F]-*){32}\}?",
        r"|-?\b(?:[0-9]+\.)?[0-9]+(?:[eE][+-]?[0-9]+)?\b",
        r"|(?i:\b(?:true|false|null)\b)",
        r"|(?:#|--)[^\r\n]*",
        r"|/\*(?:[^/]|/[^*])*?(?:\*/|/\*.*)",
    ))
    .expect("literal pattern is valid");
}

/// Replaces string, dollar-quoted, UUID, numeric and boolean literals as
/// well as comments with `?`.
///
/// Oversized statements are replaced by [`QUERY_TOO_LARGE`]. If a quote or
/// comment delimiter survives, the result is [`OBFUSCATION_FAILED`] rather
/// than a statement that may still carry data.
pub fn obfuscate_sql(sql: &str) -> String {
    if sql.chars().count() > MAX_OBFUSCATION_LENGTH {
        return QUERY_TOO_LARGE.to_owned();
    }

    let mut out = String::with_capacity(sql.len());
    let mut pos = 0;
    while pos < sql.len() {
        let quoted = next_quoted(sql, pos);
        let literal = LITERALS
            .find_at(sql, pos)
            .filter(|m| !m.as_str().is_empty())
            .map(|m| (m.start(), m.end()));

        // at the same offset quoted strings win
        let next = match (quoted, literal) {
            (Some(q), Some(l)) => Some(if l.0 < q.0 { l } else { q }),
            (q, l) => q.or(l),
        };
        let Some((start, end)) = next else {
            out.push_str(&sql[pos..]);
            break;
        };
        out.push_str(&sql[pos..start]);
        out.push('?');
        pos = end;
    }

    if has_unmatched_delimiters(&out) {
        return OBFUSCATION_FAILED.to_owned();
    }
    out
}

/// First single-quoted or dollar-quoted string starting at or after `from`.
fn next_quoted(sql: &str, from: usize) -> Option<(usize, usize)> {
    let bytes = sql.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        let found = match bytes[i] {
            b'\'' => single_quoted_end(sql, i),
            b'$' if !bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => dollar_quoted_end(sql, i),
            _ => None,
        };
        if let Some(end) = found {
            return Some((i, end));
        }
        i += 1;
    }
    None
}

/// End of a `'...'` literal opening at `start`. `''` is an escaped quote; a
/// backslash-escaped quote swallows the rest of the line.
fn single_quoted_end(sql: &str, start: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut k = start + 1;
    while k < bytes.len() {
        if bytes[k] == b'\\' && bytes.get(k + 1) == Some(&b'\'') {
            return Some(line_end(sql, k));
        }
        if bytes[k] == b'\'' {
            if bytes.get(k + 1) == Some(&b'\'') {
                k += 2;
                continue;
            }
            return Some(k + 1);
        }
        k += 1;
    }
    None
}

/// End of a `$tag$...$tag$` literal opening at `start`. An unterminated body
/// runs to the end of the line.
fn dollar_quoted_end(sql: &str, start: usize) -> Option<usize> {
    let tag_end = start + 1 + sql[start + 1..].find('$')? + 1;
    let tag = &sql[start..tag_end];
    let body_end = line_end(sql, tag_end);
    Some(
        sql[tag_end..body_end]
            .find(tag)
            .map_or(body_end, |offset| tag_end + offset + tag.len()),
    )
}

fn line_end(sql: &str, from: usize) -> usize {
    sql[from..].find('\n').map_or(sql.len(), |offset| from + offset)
}

fn has_unmatched_delimiters(sql: &str) -> bool {
    sql.contains('\'')
        || sql.contains("/*")
        || sql.contains("*/")
        || sql
            .match_indices('$')
            .any(|(i, _)| sql.as_bytes().get(i + 1) != Some(&b'?'))
}

/// Upper-cased first word of the statement, if it is a known command.
pub fn extract_operation(sql: &str) -> Option<String> {
    let word = sql.split_whitespace().next()?.to_uppercase();
    SQL_COMMANDS.contains(&word.as_str()).then_some(word)
}

/// Span name for a database call: operation and database name, space separated.
pub fn span_name(operation: Option<&str>, database: Option<&str>) -> String {
    [operation, database]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Bounded, thread-safe map from prepared statement name to obfuscated SQL.
#[derive(Debug)]
pub struct PreparedStatements {
    cache: SharedCache<String, String>,
}

impl PreparedStatements {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        Ok(Self {
            cache: SharedCache::new(capacity)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Attributes for a plain query.
    pub fn query(&self, sql: &str) -> Attributes {
        db_attributes(extract_operation(sql), Some(obfuscate_sql(sql)), None)
    }

    /// Records the statement under `name` and returns attributes for the prepare call.
    pub fn prepare(&self, name: &str, sql: &str) -> Attributes {
        let statement = obfuscate_sql(sql);
        self.cache.set(name.to_owned(), statement.clone());
        db_attributes(Some("PREPARE".into()), Some(statement), Some(name))
    }

    /// Attributes for executing a prepared statement. The statement text is
    /// included only while `name` is still cached.
    pub fn execute(&self, name: &str) -> Attributes {
        let statement = self.cache.get(&name.to_owned());
        db_attributes(Some("EXECUTE".into()), statement, Some(name))
    }
}

fn db_attributes(
    operation: Option<String>,
    statement: Option<String>,
    statement_name: Option<&str>,
) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("db.system".into(), AttributeValue::from("postgresql"));
    if let Some(operation) = operation {
        attributes.insert("db.operation".into(), operation.into());
    }
    if let Some(statement) = statement {
        attributes.insert("db.statement".into(), statement.into());
    }
    if let Some(name) = statement_name {
        attributes.insert("db.postgresql.prepared_statement_name".into(), name.into());
    }
    attributes
}
