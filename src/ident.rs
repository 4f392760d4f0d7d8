//! Identifier validation and quoting
//!
//! Entity, table, column and index names pass through here once, at
//! registration time. Backends receive pre-validated names and may quote
//! them with [`quote_identifier`] when rendering statements.

use regex::Regex;
use std::sync::OnceLock;

/// Keywords that are reserved in effectively every SQL dialect and therefore
/// rejected as table/column names regardless of backend.
pub const RESERVED_WORDS: &[&str] = &[
    "ALL", "AND", "ANY", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK", "COLUMN", "CONSTRAINT",
    "CREATE", "CROSS", "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "END", "EXCEPT",
    "EXISTS", "FALSE", "FOR", "FOREIGN", "FROM", "FULL", "GROUP", "HAVING", "IN", "INNER",
    "INSERT", "INTERSECT", "INTO", "IS", "JOIN", "LEFT", "LIKE", "LIMIT", "NOT", "NULL", "OFFSET",
    "ON", "OR", "ORDER", "OUTER", "PRIMARY", "REFERENCES", "RIGHT", "SELECT", "SET", "TABLE",
    "THEN", "TO", "TRUE", "UNION", "UNIQUE", "UPDATE", "USING", "VALUES", "WHEN", "WHERE", "WITH",
];

fn ident_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("static pattern"))
}

/// Quote an identifier for embedding in a rendered statement.
///
/// Internal double quotes are doubled, so the result is safe to splice even
/// for names that failed [`validate_identifier`].
pub fn quote_identifier(identifier: &str) -> String {
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

/// Validate a table, column or index name.
///
/// Rules:
/// - must start with a lowercase letter
/// - may only contain lowercase letters, digits and underscores
/// - must not be a reserved SQL keyword
pub fn validate_identifier(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("identifier cannot be empty".to_string());
    }

    if !ident_pattern().is_match(name) {
        return Err(format!(
            "identifier '{name}' must start with a lowercase letter and contain only lowercase letters, digits and underscores"
        ));
    }

    if RESERVED_WORDS.contains(&name.to_uppercase().as_str()) {
        return Err(format!("identifier '{name}' is a reserved SQL keyword"));
    }

    Ok(())
}

/// Validate a logical entity name.
///
/// Entity names never reach a statement, so the reserved-keyword check does
/// not apply; only the shape rule does.
pub fn validate_entity_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("entity name cannot be empty".to_string());
    }
    if !ident_pattern().is_match(name) {
        return Err(format!(
            "entity name '{name}' must start with a lowercase letter and contain only lowercase letters, digits and underscores"
        ));
    }
    Ok(())
}
