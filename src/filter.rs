// Copyright 2025
// Licensed under the Elastic License v2.0

//! Schema/table filter rules.
//!
//! A rule is compiled once per data source from its `FilterConfig` blocks. A
//! per-schema pattern shadows the global one entirely; within a pattern,
//! excludes beat includes, and an entry with a trailing `_` matches any table
//! starting with the entry minus the `_`.

use std::collections::HashMap;

use crate::config::{DataSourceConfig, FilterConfig};

/// One include/exclude pattern block.
#[derive(Debug, Clone, Default)]
pub struct FilterPattern {
    pub include_schemas: Vec<String>,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
}

impl FilterPattern {
    fn from_config(config: &FilterConfig) -> Self {
        Self {
            include_schemas: split_comma(&config.include_schemas),
            include_tables: split_comma(&config.include_tables),
            exclude_tables: split_comma(&config.exclude_tables),
        }
    }

    /// Evaluate against a (schema, table) pair. An empty `schema` or `table`
    /// skips that half of the check, which is how schema-only gating and
    /// per-schema rules are expressed.
    fn allow(&self, schema: &str, table: &str) -> bool {
        if !schema.is_empty()
            && !self.include_schemas.is_empty()
            && !self.include_schemas.iter().any(|s| s == schema)
        {
            return false;
        }
        if !table.is_empty() {
            // Excludes win over includes
            if contains_with_prefix(&self.exclude_tables, table) {
                return false;
            }
            if !self.include_tables.is_empty() {
                return contains_with_prefix(&self.include_tables, table);
            }
        }
        true
    }
}

/// Compiled filter for one data source.
#[derive(Debug, Clone, Default)]
pub struct FilterRule {
    pub global: Option<FilterPattern>,
    pub by_schema: HashMap<String, FilterPattern>,
}

impl FilterRule {
    pub fn compile(config: &DataSourceConfig) -> Self {
        let global = config.global_filter.as_ref().map(FilterPattern::from_config);
        let by_schema = config
            .schema_filters
            .iter()
            .map(|(schema, fc)| (schema.clone(), FilterPattern::from_config(fc)))
            .collect();
        Self { global, by_schema }
    }

    /// Decide whether `(schema, table)` is in scope. A per-schema rule takes
    /// precedence and implies inclusion of its schema; otherwise the global
    /// pattern applies; no configuration allows everything.
    pub fn allow(&self, schema: &str, table: &str) -> bool {
        if let Some(pattern) = self.by_schema.get(schema) {
            return pattern.allow("", table);
        }
        if let Some(pattern) = &self.global {
            return pattern.allow(schema, table);
        }
        true
    }

    /// Keep only schemas that pass schema-level gating.
    pub fn allow_schemas(&self, schemas: Vec<String>) -> Vec<String> {
        schemas
            .into_iter()
            .filter(|schema| self.allow(schema, ""))
            .collect()
    }
}

fn split_comma(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Exact match, or prefix match for entries with a trailing `_`.
fn contains_with_prefix(entries: &[String], candidate: &str) -> bool {
    entries.iter().any(|entry| {
        if let Some(prefix) = entry.strip_suffix('_') {
            if candidate.starts_with(prefix) {
                return true;
            }
        }
        entry == candidate
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from_toml(input: &str) -> DataSourceConfig {
        toml::from_str(input).unwrap()
    }

    fn rule(input: &str) -> FilterRule {
        FilterRule::compile(&config_from_toml(input))
    }

    const BASE: &str = r#"
        id = "test"
        type = "mysql"
        host = "localhost"
        user = "root"
    "#;

    #[test]
    fn test_no_configuration_allows_everything() {
        let rule = rule(BASE);
        assert!(rule.allow("anything", "at_all"));
        assert!(rule.allow("", ""));
    }

    #[test]
    fn test_schema_rule_shadows_global() {
        let toml = format!(
            r#"{BASE}
            [global_filter]
            include_schemas = "app"
            [schema_filters.logs]
            include_tables = "errors"
            "#
        );
        let rule = rule(&toml);
        // Global would reject "logs", but the per-schema rule implies it
        assert!(rule.allow("logs", "errors"));
        assert!(!rule.allow("logs", "other"));
        assert!(rule.allow("app", "x"));
        assert!(!rule.allow("other", "x"));
    }

    #[test]
    fn test_exclude_beats_include() {
        let toml = format!(
            r#"{BASE}
            [global_filter]
            include_tables = "orders"
            exclude_tables = "orders"
            "#
        );
        assert!(!rule(&toml).allow("app", "orders"));
    }

    #[test]
    fn test_prefix_matching() {
        let toml = format!(
            r#"{BASE}
            [global_filter]
            include_tables = "users_"
            "#
        );
        let rule = rule(&toml);
        assert!(rule.allow("app", "users_a"));
        assert!(rule.allow("app", "users_"));
        assert!(rule.allow("app", "users"));
        assert!(!rule.allow("app", "user"));
    }

    #[test]
    fn test_exclude_prefix() {
        let toml = format!(
            r#"{BASE}
            [global_filter]
            exclude_tables = "tmp_"
            "#
        );
        let rule = rule(&toml);
        assert!(!rule.allow("app", "tmp_import"));
        assert!(rule.allow("app", "orders"));
    }

    #[test]
    fn test_schema_gating_with_empty_table() {
        let toml = format!(
            r#"{BASE}
            [global_filter]
            include_schemas = "app, logs"
            exclude_tables = "tmp_"
            "#
        );
        let rule = rule(&toml);
        let schemas = rule.allow_schemas(vec![
            "app".to_string(),
            "logs".to_string(),
            "other".to_string(),
        ]);
        assert_eq!(schemas, vec!["app", "logs"]);
    }

    #[test]
    fn test_split_comma_trims() {
        assert_eq!(split_comma("  a , b ,,c "), vec!["a", "b", "c"]);
        assert!(split_comma("").is_empty());
    }
}
