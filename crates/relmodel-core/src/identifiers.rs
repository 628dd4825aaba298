//! SQL identifier validation and quoting.

use regex::Regex;
use std::sync::OnceLock;

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| match Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$") {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!(error = %e, "identifier pattern failed to compile");
                None
            }
        })
        .as_ref()
}

/// Is `name` usable as an unquoted table, column, entity or association name?
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|regex| regex.is_match(name))
}

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// # Examples
///
/// ```
/// use relmodel_core::quote_ident;
///
/// assert_eq!(quote_ident("parent"), "\"parent\"");
/// assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
