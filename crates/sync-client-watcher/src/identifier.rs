//! Table and column names arrive as caller-supplied configuration, not as
//! untrusted network input, but they still get interpolated straight into
//! SQL text — SQLite has no bind-parameter syntax for identifiers. Validate
//! the charset once at `add_table` time so every later query built from the
//! same name is safe by construction.

use crate::error::{WatcherError, WatcherResult};

const SHADOW_PREFIX: &str = "__sync_";

pub fn validate(identifier: &str) -> WatcherResult<()> {
    let mut chars = identifier.chars();
    let starts_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if identifier.is_empty() || !starts_ok || !rest_ok {
        return Err(WatcherError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}

/// Double-quote a validated identifier for use in SQL text.
pub fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

pub fn shadow_table(table: &str) -> String {
    format!("{SHADOW_PREFIX}{table}")
}

pub fn changed_index(table: &str) -> String {
    format!("{SHADOW_PREFIX}{table}_changed_idx")
}

pub fn insert_trigger(table: &str) -> String {
    format!("{SHADOW_PREFIX}{table}_insert_trg")
}

pub fn update_trigger(table: &str) -> String {
    format!("{SHADOW_PREFIX}{table}_update_trg")
}

pub fn rename_trigger(table: &str) -> String {
    format!("{SHADOW_PREFIX}{table}_rename_trg")
}

pub fn delete_trigger(table: &str) -> String {
    format!("{SHADOW_PREFIX}{table}_delete_trg")
}

/// Strip the shadow-table prefix back off, used by the `update_hook` filter
/// to recover the plain table name worth notifying about.
pub fn strip_shadow_prefix(name: &str) -> Option<&str> {
    name.strip_prefix(SHADOW_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_identifiers() {
        assert!(validate("contacts").is_ok());
        assert!(validate("_private_table").is_ok());
        assert!(validate("table_42").is_ok());
    }

    #[test]
    fn rejects_identifiers_that_could_break_out_of_quoting() {
        assert!(validate("").is_err());
        assert!(validate("contacts\"; DROP TABLE users; --").is_err());
        assert!(validate("1starts_with_digit").is_err());
        assert!(validate("has space").is_err());
    }

    #[test]
    fn shadow_name_round_trips() {
        let shadow = shadow_table("contacts");
        assert_eq!(strip_shadow_prefix(&shadow), Some("contacts"));
    }
}
