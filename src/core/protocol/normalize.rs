// src/core/protocol/normalize.rs

//! Produces the "normalized" form of a statement: literals become `?` so that
//! statements differing only in their arguments share one text.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    /// Quoted identifiers are matched first so their contents are left alone.
    static ref LITERALS: Regex = Regex::new(
        r#"(?x)
          (?P<ident>`[^`]*`)
        | (?P<hexstr>\b[xX]'[0-9a-fA-F]*')
        | (?P<str>'(?:[^'\\]|\\.|'')*'|"(?:[^"\\]|\\.|"")*")
        | (?P<hex>\b0[xX][0-9a-fA-F]+\b)
        | (?P<num>\b\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b)
        "#
    )
    .unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref IN_LIST: Regex = Regex::new(r"(?i)\bIN\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").unwrap();
    static ref VALUE_TUPLES: Regex = Regex::new(
        r"\(\s*\?(?:\s*,\s*\?)*\s*\)(?:\s*,\s*\(\s*\?(?:\s*,\s*\?)*\s*\))+"
    )
    .unwrap();
    static ref FIRST_TUPLE: Regex = Regex::new(r"^\(\s*\?(?:\s*,\s*\?)*\s*\)").unwrap();
}

/// Normalizes a statement for grouping.
///
/// ```
/// use mysqlprobe::core::protocol::normalize_query;
///
/// assert_eq!(
///     normalize_query("SELECT * FROM t WHERE id IN (1, 2, 3) AND name = 'bob';"),
///     "SELECT * FROM t WHERE id IN (?) AND name = ?"
/// );
/// ```
pub fn normalize_query(sql: &str) -> String {
    let replaced = LITERALS.replace_all(sql, |caps: &Captures| {
        if let Some(ident) = caps.name("ident") {
            ident.as_str().to_string()
        } else {
            "?".to_string()
        }
    });
    let collapsed = WHITESPACE.replace_all(&replaced, " ");
    let in_lists = IN_LIST.replace_all(&collapsed, "IN (?)");
    let tuples = VALUE_TUPLES.replace_all(&in_lists, |caps: &Captures| {
        let all = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        FIRST_TUPLE
            .find(all)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| all.to_string())
    });

    tuples.trim().trim_end_matches(';').trim_end().to_string()
}
