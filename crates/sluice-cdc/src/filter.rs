//! Table selection
//!
//! Schema, table and exclusion patterns use SQL `LIKE` syntax and ignore case.
//! A table is captured when any selector matches it.

use crate::config::TableSelector;
use crate::error::{CdcError, Result};
use sluice_core::{PatternMatcher, PatternSyntax};

#[derive(Debug, Clone)]
struct CompiledSelector {
    schema: PatternMatcher,
    table: PatternMatcher,
    exclude: Option<PatternMatcher>,
}

impl CompiledSelector {
    fn matches(&self, schema: &str, table: &str) -> bool {
        self.schema.matches(schema)
            && self.table.matches(table)
            && !self.exclude.as_ref().is_some_and(|e| e.matches(table))
    }
}

/// Compiled table filter
#[derive(Debug, Clone)]
pub struct TableFilter {
    selectors: Vec<CompiledSelector>,
}

impl TableFilter {
    pub fn new(selectors: &[TableSelector]) -> Result<Self> {
        let selectors = selectors
            .iter()
            .map(|s| {
                Ok(CompiledSelector {
                    schema: like(&s.schema)?,
                    table: like(&s.table)?,
                    exclude: s.exclude_pattern.as_deref().map(like).transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { selectors })
    }

    pub fn matches(&self, schema: &str, table: &str) -> bool {
        self.selectors.iter().any(|s| s.matches(schema, table))
    }
}

fn like(pattern: &str) -> Result<PatternMatcher> {
    PatternMatcher::builder(pattern)
        .syntax(PatternSyntax::Like)
        .case_insensitive(true)
        .build()
        .map_err(|e| CdcError::config(format!("invalid table pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_patterns() {
        let filter = TableFilter::new(&[TableSelector::new("SALES", "ORDERS_%")]).unwrap();
        assert!(filter.matches("sales", "orders_2024"));
        assert!(filter.matches("SALES", "ORDERS_"));
        assert!(!filter.matches("SALES", "ORDERS"));
        assert!(!filter.matches("HR", "ORDERS_2024"));
    }

    #[test]
    fn test_exclusion() {
        let filter = TableFilter::new(&[
            TableSelector::new("SALES", "%").excluding("%_ARCHIVE"),
        ])
        .unwrap();
        assert!(filter.matches("SALES", "ORDERS"));
        assert!(!filter.matches("SALES", "ORDERS_ARCHIVE"));
    }

    #[test]
    fn test_single_character_wildcard() {
        let filter = TableFilter::new(&[TableSelector::new("S", "T_")]).unwrap();
        assert!(filter.matches("s", "T1"));
        assert!(!filter.matches("s", "T12"));
    }

    #[test]
    fn test_empty_pattern_is_config_error() {
        assert!(matches!(
            TableFilter::new(&[TableSelector::new("", "T")]),
            Err(CdcError::Configuration(_))
        ));
    }
}
