//! ClickHouse identifier quoting and literal escaping
//!
//! Every identifier or literal interpolated into generated SQL goes
//! through these two functions; there is no other string concatenation
//! path into a query.

/// Quote an identifier with backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

/// Escape a string for inclusion in a single-quoted ClickHouse literal.
pub fn escape_str(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
