//! Per-table routing: a [`Rule`] pairs a source table's schema with the
//! [`EventHandler`] that turns its row events into sink queries, keyed by
//! [`rule_key`].

use std::collections::HashMap;
use std::sync::RwLock;

use mymy_handler::EventHandler;
use mymy_schema::{rule_key, Column, SourceInfo};

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("no primary keys found for {schema}.{table}")]
    NoPrimaryKeys { schema: String, table: String },
    #[error("rule does not exist for {schema}.{table}")]
    NotFound { schema: String, table: String },
}

pub struct Rule {
    pub source: SourceInfo,
    pub handler: Box<dyn EventHandler>,
}

impl Rule {
    pub fn new(source: SourceInfo, handler: Box<dyn EventHandler>) -> Result<Self, RuleError> {
        if source.pks.is_empty() {
            return Err(RuleError::NoPrimaryKeys {
                schema: source.schema,
                table: source.table,
            });
        }
        Ok(Rule { source, handler })
    }
}

/// Registry of active rules, keyed by `"schema:table"`. Looked up once per
/// row event and refreshed in place on a table-changed notification, so a
/// handler always sees the current column layout before the next batch of
/// rows for that table is dispatched.
#[derive(Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        RuleRegistry {
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, rule: Rule) {
        let key = rule_key(&rule.source.schema, &rule.source.table);
        self.rules.write().unwrap().insert(key, rule);
    }

    /// Replace the pks/cols of the rule for `schema.table` with a freshly
    /// discovered layout, leaving the handler untouched. Returns
    /// `RuleError::NotFound` when no rule is registered for the table —
    /// callers should treat that as a non-fatal "nothing to refresh", not an
    /// error worth aborting replication over.
    pub fn refresh(&self, schema: &str, table: &str, pks: Vec<Column>, cols: Vec<Column>) -> Result<(), RuleError> {
        let key = rule_key(schema, table);
        let mut rules = self.rules.write().unwrap();
        let rule = rules.get_mut(&key).ok_or_else(|| RuleError::NotFound {
            schema: schema.to_string(),
            table: table.to_string(),
        })?;
        rule.source.pks = pks;
        rule.source.cols = cols;
        Ok(())
    }

    pub fn with_rule<R>(&self, schema: &str, table: &str, f: impl FnOnce(&Rule) -> R) -> Option<R> {
        let key = rule_key(schema, table);
        let rules = self.rules.read().unwrap();
        rules.get(&key).map(f)
    }

    pub fn with_rule_mut<R>(&self, schema: &str, table: &str, f: impl FnOnce(&mut Rule) -> R) -> Option<R> {
        let key = rule_key(schema, table);
        let mut rules = self.rules.write().unwrap();
        rules.get_mut(&key).map(f)
    }

    pub fn contains(&self, schema: &str, table: &str) -> bool {
        let key = rule_key(schema, table);
        self.rules.read().unwrap().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mymy_handler::{ColumnFilter, ProjectionHandler};
    use mymy_schema::ColumnType;

    fn source(pks: Vec<Column>) -> SourceInfo {
        SourceInfo {
            schema: "city".into(),
            table: "users".into(),
            pks,
            cols: vec![Column::new(1, "name", ColumnType::String)],
        }
    }

    #[test]
    fn rule_rejects_empty_pks() {
        let handler = Box::new(ProjectionHandler::new("clients", ColumnFilter::None));
        let err = Rule::new(source(vec![]), handler).unwrap_err();
        assert!(matches!(err, RuleError::NoPrimaryKeys { .. }));
    }

    #[test]
    fn registry_insert_and_lookup() {
        let pks = vec![Column::new(0, "id", ColumnType::Number)];
        let handler = Box::new(ProjectionHandler::new("clients", ColumnFilter::None));
        let rule = Rule::new(source(pks), handler).unwrap();

        let registry = RuleRegistry::new();
        registry.insert(rule);

        assert!(registry.contains("city", "users"));
        assert_eq!(registry.len(), 1);
        assert!(registry.with_rule("city", "missing", |_| ()).is_none());
    }

    #[test]
    fn refresh_updates_columns_in_place() {
        let pks = vec![Column::new(0, "id", ColumnType::Number)];
        let handler = Box::new(ProjectionHandler::new("clients", ColumnFilter::None));
        let rule = Rule::new(source(pks), handler).unwrap();

        let registry = RuleRegistry::new();
        registry.insert(rule);

        let new_pks = vec![Column::new(0, "id", ColumnType::Number)];
        let new_cols = vec![
            Column::new(1, "name", ColumnType::String),
            Column::new(2, "email", ColumnType::String),
        ];
        registry.refresh("city", "users", new_pks, new_cols).unwrap();

        registry
            .with_rule("city", "users", |rule| {
                assert_eq!(rule.source.cols.len(), 2);
            })
            .unwrap();
    }

    #[test]
    fn refresh_missing_rule_is_not_found() {
        let registry = RuleRegistry::new();
        let err = registry.refresh("city", "missing", vec![], vec![]).unwrap_err();
        assert!(matches!(err, RuleError::NotFound { .. }));
    }
}
