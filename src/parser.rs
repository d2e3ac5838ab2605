//! SQL parsing utilities for naming query spans.

use once_cell::sync::Lazy;
use regex::Regex;

/// Category of a SQL statement, used as the span name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    Begin,
    Commit,
    Rollback,
    Set,
    Other,
}

/// Leading keyword of a statement and the category it maps to.
const KEYWORDS: &[(&str, SqlOperation)] = &[
    ("SELECT", SqlOperation::Select),
    ("WITH", SqlOperation::Select),
    ("INSERT", SqlOperation::Insert),
    ("UPDATE", SqlOperation::Update),
    ("DELETE", SqlOperation::Delete),
    ("CREATE", SqlOperation::Create),
    ("DROP", SqlOperation::Drop),
    ("ALTER", SqlOperation::Alter),
    ("TRUNCATE", SqlOperation::Truncate),
    ("BEGIN", SqlOperation::Begin),
    ("START", SqlOperation::Begin),
    ("COMMIT", SqlOperation::Commit),
    ("ROLLBACK", SqlOperation::Rollback),
    ("SET", SqlOperation::Set),
];

impl SqlOperation {
    /// Returns the operation as a string suitable for span names.
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Select => "SELECT",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Update => "UPDATE",
            SqlOperation::Delete => "DELETE",
            SqlOperation::Create => "CREATE",
            SqlOperation::Drop => "DROP",
            SqlOperation::Alter => "ALTER",
            SqlOperation::Truncate => "TRUNCATE",
            SqlOperation::Begin => "BEGIN",
            SqlOperation::Commit => "COMMIT",
            SqlOperation::Rollback => "ROLLBACK",
            SqlOperation::Set => "SET",
            SqlOperation::Other => "QUERY",
        }
    }

    /// Pattern capturing the primary table for this category, if it has one.
    fn table_regex(self) -> Option<&'static Regex> {
        let regex = match self {
            SqlOperation::Select => &SELECT_TABLE_REGEX,
            SqlOperation::Insert => &INSERT_TABLE_REGEX,
            SqlOperation::Update => &UPDATE_TABLE_REGEX,
            SqlOperation::Delete => &DELETE_TABLE_REGEX,
            SqlOperation::Create => &CREATE_TABLE_REGEX,
            SqlOperation::Drop => &DROP_TABLE_REGEX,
            SqlOperation::Alter => &ALTER_TABLE_REGEX,
            SqlOperation::Truncate => &TRUNCATE_TABLE_REGEX,
            _ => return None,
        };
        Some(Lazy::force(regex))
    }
}

impl std::fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Identifier optionally wrapped in backticks, double quotes or brackets
macro_rules! table_regex {
    ($prefix:literal) => {
        Lazy::new(|| {
            Regex::new(concat!("(?i)", $prefix, r#"[`"\[]?(\w+)[`"\]]?"#))
                .expect("table pattern is valid")
        })
    };
}

static SELECT_TABLE_REGEX: Lazy<Regex> = table_regex!(r"\bFROM\s+");
static INSERT_TABLE_REGEX: Lazy<Regex> = table_regex!(r"\bINSERT\s+INTO\s+");
static UPDATE_TABLE_REGEX: Lazy<Regex> = table_regex!(r"\bUPDATE\s+");
static DELETE_TABLE_REGEX: Lazy<Regex> = table_regex!(r"\bDELETE\s+FROM\s+");
static CREATE_TABLE_REGEX: Lazy<Regex> = table_regex!(
    r"\bCREATE\s+(?:TEMP(?:ORARY)?\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?"
);
static DROP_TABLE_REGEX: Lazy<Regex> = table_regex!(r"\bDROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?");
static ALTER_TABLE_REGEX: Lazy<Regex> = table_regex!(r"\bALTER\s+TABLE\s+");
static TRUNCATE_TABLE_REGEX: Lazy<Regex> = table_regex!(r"\bTRUNCATE\s+(?:TABLE\s+)?");

/// Parse the SQL operation type from a query string.
pub fn parse_operation(sql: &str) -> SqlOperation {
    let first_word = sql
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("");

    KEYWORDS
        .iter()
        .find(|(keyword, _)| first_word.eq_ignore_ascii_case(keyword))
        .map_or(SqlOperation::Other, |(_, operation)| *operation)
}

/// Extract the primary table name from a SQL query.
///
/// Returns `None` if the table cannot be determined.
pub fn extract_table(sql: &str) -> Option<String> {
    table_for(parse_operation(sql), sql)
}

fn table_for(operation: SqlOperation, sql: &str) -> Option<String> {
    operation
        .table_regex()?
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Parsed SQL information for span creation.
#[derive(Debug)]
pub struct ParsedSql {
    pub operation: SqlOperation,
    pub table: Option<String>,
}

impl ParsedSql {
    /// Parse a SQL statement and extract operation and table information.
    pub fn parse(sql: &str) -> Self {
        let operation = parse_operation(sql);
        let table = table_for(operation, sql);
        Self { operation, table }
    }

    /// Span name: "{OPERATION} {table}" or "{OPERATION}".
    pub fn span_name(&self) -> String {
        match &self.table {
            Some(table) => format!("{} {}", self.operation, table),
            None => self.operation.as_str().to_string(),
        }
    }
}
