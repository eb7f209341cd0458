// Copyright 2025
// Licensed under the Elastic License v2.0

//! Utility functions for binrelay
//!
//! This module provides common utility functions including:
//! - SQL identifier validation to prevent SQL injection
//! - Backtick quoting for identifiers interpolated into catalog queries

use anyhow::{anyhow, Result};

/// Validates that a SQL identifier (schema name, table name, column name)
/// contains only characters MySQL allows in unquoted identifiers.
///
/// Identifiers coming from the catalog or from configuration are interpolated
/// into `SHOW CREATE TABLE` / `SELECT ... FROM` statements, so everything that
/// could terminate the quoting or smuggle a second statement is rejected:
/// only letters, digits, underscores and `$` pass.
pub fn validate_sql_identifier(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(anyhow!("SQL identifier cannot be empty"));
    }

    // MySQL hard limit for identifiers
    if name.len() > 64 {
        return Err(anyhow!(
            "Invalid SQL identifier '{}': longer than 64 characters",
            name
        ));
    }

    let is_valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');

    if !is_valid {
        return Err(anyhow!(
            "Invalid SQL identifier '{}': only letters, digits, '_' and '$' are allowed",
            name
        ));
    }

    Ok(name)
}

/// Quote a single identifier with backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name)
}

/// Quote a `schema.table` pair for interpolation into a statement.
pub fn quote_table(schema: &str, table: &str) -> String {
    format!("`{}`.`{}`", schema, table)
}
