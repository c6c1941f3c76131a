//! Input validation for connector and task configuration
//!
//! Protects against:
//! - Injection via identifiers sent to the server
//! - Malformed connection URLs
//! - Unusable task ids

use crate::common::{CdcError, Result};
use regex::Regex;
use std::sync::LazyLock;

/// Maximum allowed identifier length
const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Connection timeout (30 seconds)
pub const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Regex for validating SQL identifiers
static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,254}$").expect("identifier regex is valid")
});

/// MySQL account names may also contain `-`, `.` and `@`.
static USER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9_.@\-]{0,79}$").expect("user regex is valid")
});

/// Validator for CDC inputs
pub struct Validator;

impl Validator {
    /// Validate a SQL identifier (schema, table or column name).
    pub fn validate_identifier(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CdcError::config("Identifier cannot be empty"));
        }

        if name.len() > MAX_IDENTIFIER_LENGTH {
            return Err(CdcError::config(format!(
                "Identifier too long: {} chars (max: {})",
                name.len(),
                MAX_IDENTIFIER_LENGTH
            )));
        }

        if !IDENTIFIER_REGEX.is_match(name) {
            return Err(CdcError::config(format!(
                "Invalid identifier '{}': must start with letter/underscore and contain only alphanumeric characters and underscores",
                name
            )));
        }

        Ok(())
    }

    /// Validate the account name sent in the handshake.
    pub fn validate_user(user: &str) -> Result<()> {
        if !USER_REGEX.is_match(user) {
            return Err(CdcError::config(format!("Invalid user name '{}'", user)));
        }
        Ok(())
    }

    /// Validate a connection URL
    pub fn validate_connection_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(CdcError::config("Connection URL cannot be empty"));
        }

        let valid_schemes = ["mysql://", "mariadb://", "jdbc:mysql://", "jdbc:mariadb://"];
        if !valid_schemes.iter().any(|s| url.starts_with(s)) {
            return Err(CdcError::config(format!(
                "Invalid connection URL scheme. Expected one of: {:?}",
                valid_schemes
            )));
        }

        Ok(())
    }

    /// Task ids key the registry and the metadata store.
    pub fn validate_task_id(task_id: &str) -> Result<()> {
        if task_id.trim().is_empty() {
            return Err(CdcError::config("Task id cannot be empty"));
        }
        if task_id.len() > MAX_IDENTIFIER_LENGTH {
            return Err(CdcError::config(format!(
                "Task id too long: {} chars (max: {})",
                task_id.len(),
                MAX_IDENTIFIER_LENGTH
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(Validator::validate_identifier("orders").is_ok());
        assert!(Validator::validate_identifier("_tmp_1").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(Validator::validate_identifier("").is_err());
        assert!(Validator::validate_identifier("1abc").is_err());
        assert!(Validator::validate_identifier("a;drop").is_err());
        assert!(Validator::validate_identifier(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_user_names() {
        assert!(Validator::validate_user("repl-user").is_ok());
        assert!(Validator::validate_user("cdc.reader").is_ok());
        assert!(Validator::validate_user("").is_err());
        assert!(Validator::validate_user("bad'quote").is_err());
        assert!(Validator::validate_user("has space").is_err());
    }

    #[test]
    fn test_connection_url() {
        assert!(Validator::validate_connection_url("mysql://db1:3306/shop").is_ok());
        assert!(Validator::validate_connection_url("jdbc:mysql://db1,db2/shop").is_ok());
        assert!(Validator::validate_connection_url("postgres://db1").is_err());
        assert!(Validator::validate_connection_url("").is_err());
    }

    #[test]
    fn test_task_id() {
        assert!(Validator::validate_task_id("mapping-1").is_ok());
        assert!(Validator::validate_task_id("  ").is_err());
    }

    #[test]
    fn test_errors_are_configuration() {
        let err = Validator::validate_identifier("").unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));
    }
}
