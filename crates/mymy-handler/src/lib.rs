//! The contract plugins implement, plus a built-in projection ("filter")
//! handler providing include/exclude column projection.
//!
//! Upstream loads handler plugins as dynamically opened shared objects
//! looked up by name at runtime. Rust has no safe equivalent to that, so
//! plugins here are registered statically: a [`HandlerFactory`] per handler
//! name, compiled into the binary and looked up by name from a
//! [`StaticHandlerRegistry`] at startup instead of `dlopen`'d from a
//! configured plugin directory.

use std::collections::{HashMap, HashSet};

use mymy_query::{Action, Query, QueryArg};
use mymy_schema::{ColumnError, RowsEvent, SourceInfo};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unknown action type: {0:?}")]
    UnknownAction(Action),
    #[error("update rows event must carry an even number of rows (before/after pairs), got {0}")]
    OddUpdateRows(usize),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error("no handler registered under name {0:?}")]
    UnknownHandler(String),
    #[error("invalid handler configuration: {0}")]
    InvalidConfig(String),
}

/// Implemented by plugins. The core calls these from a single producer
/// thread only — no parallel invocation, so implementations need not be
/// internally synchronised against concurrent calls from this crate.
pub trait EventHandler: Send {
    fn on_table_changed(&mut self, info: &SourceInfo) -> Result<(), HandlerError>;
    fn on_rows(&mut self, event: &RowsEvent) -> Result<Vec<Query>, HandlerError>;
}

/// One of the two mutually exclusive column lists a [`ProjectionHandler`]
/// may be configured with, or neither.
#[derive(Debug, Clone)]
pub enum ColumnFilter {
    /// Allow-list: only these non-pk columns are propagated.
    SyncOnly(Vec<String>),
    /// Deny-list: every non-pk column except these is propagated.
    Skip(Vec<String>),
    /// All non-pk columns pass through.
    None,
}

/// Built-in handler: projects rows from the source table onto `target_table`,
/// including/excluding non-pk columns per [`ColumnFilter`]. Primary-key
/// updates propagate: the WHERE clause always keys off the *before* row's
/// pks, while the SET list's pk slots come from the *after* row, so a pk
/// change on the source carries through to the sink (see the design notes'
/// Open Question on this semantic).
pub struct ProjectionHandler {
    target_table: String,
    sync_only: Option<HashSet<String>>,
    skip: Option<HashSet<String>>,
}

impl ProjectionHandler {
    pub fn new(target_table: impl Into<String>, filter: ColumnFilter) -> Self {
        let (sync_only, skip) = match filter {
            ColumnFilter::SyncOnly(cols) => (Some(cols.into_iter().collect()), None),
            ColumnFilter::Skip(cols) => (None, Some(cols.into_iter().collect())),
            ColumnFilter::None => (None, None),
        };
        ProjectionHandler {
            target_table: target_table.into(),
            sync_only,
            skip,
        }
    }

    fn is_allowed(&self, name: &str) -> bool {
        if let Some(only) = &self.sync_only {
            return only.contains(name);
        }
        if let Some(skip) = &self.skip {
            return !skip.contains(name);
        }
        true
    }
}

impl EventHandler for ProjectionHandler {
    fn on_table_changed(&mut self, _info: &SourceInfo) -> Result<(), HandlerError> {
        // Each RowsEvent carries its own SourceInfo snapshot, so there is no
        // cached schema state here to refresh.
        Ok(())
    }

    fn on_rows(&mut self, event: &RowsEvent) -> Result<Vec<Query>, HandlerError> {
        match event.action {
            Action::Insert => self.on_insert(event),
            Action::Update => self.on_update(event),
            Action::Delete => self.on_delete(event),
        }
    }
}

impl ProjectionHandler {
    fn on_insert(&self, event: &RowsEvent) -> Result<Vec<Query>, HandlerError> {
        let mut queries = Vec::with_capacity(event.rows.len());
        for row in &event.rows {
            let mut values = Vec::with_capacity(event.source.pks.len() + event.source.cols.len());
            for pk in &event.source.pks {
                values.push(QueryArg::new(pk.name.clone(), pk.value(row)?.clone()));
            }
            for col in &event.source.cols {
                if self.is_allowed(&col.name) {
                    values.push(QueryArg::new(col.name.clone(), col.value(row)?.clone()));
                }
            }
            queries.push(Query::insert(self.target_table.clone(), values));
        }
        Ok(queries)
    }

    fn on_update(&self, event: &RowsEvent) -> Result<Vec<Query>, HandlerError> {
        if event.rows.len() % 2 != 0 {
            return Err(HandlerError::OddUpdateRows(event.rows.len()));
        }

        let mut queries = Vec::with_capacity(event.rows.len() / 2);
        for pair in event.rows.chunks_exact(2) {
            let (before, after) = (&pair[0], &pair[1]);

            let mut where_ = Vec::with_capacity(event.source.pks.len());
            for pk in &event.source.pks {
                where_.push(QueryArg::new(pk.name.clone(), pk.value(before)?.clone()));
            }

            let mut values = Vec::with_capacity(event.source.pks.len() + event.source.cols.len());
            for pk in &event.source.pks {
                values.push(QueryArg::new(pk.name.clone(), pk.value(after)?.clone()));
            }
            for col in &event.source.cols {
                if self.is_allowed(&col.name) {
                    values.push(QueryArg::new(col.name.clone(), col.value(after)?.clone()));
                }
            }

            queries.push(Query::update(self.target_table.clone(), values, where_));
        }
        Ok(queries)
    }

    fn on_delete(&self, event: &RowsEvent) -> Result<Vec<Query>, HandlerError> {
        let mut queries = Vec::with_capacity(event.rows.len());
        for row in &event.rows {
            let mut where_ = Vec::with_capacity(event.source.pks.len());
            for pk in &event.source.pks {
                where_.push(QueryArg::new(pk.name.clone(), pk.value(row)?.clone()));
            }
            queries.push(Query::delete(self.target_table.clone(), where_));
        }
        Ok(queries)
    }
}

/// Builds one named handler kind from its per-rule configuration document.
/// Implementations are registered into a [`StaticHandlerRegistry`] at build
/// time; there is no runtime discovery.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn EventHandler>, HandlerError>;
}

/// A name-keyed set of [`HandlerFactory`] implementations, standing in for
/// upstream's plugin-directory `.so` lookup. Construction is explicit and
/// exhaustive: every handler name a config can reference must be registered
/// here before the registry is handed to the supervisor.
#[derive(Default)]
pub struct StaticHandlerRegistry {
    factories: HashMap<String, Box<dyn HandlerFactory>>,
}

impl StaticHandlerRegistry {
    pub fn new() -> Self {
        StaticHandlerRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Box<dyn HandlerFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn create(&self, name: &str, config: &serde_json::Value) -> Result<Box<dyn EventHandler>, HandlerError> {
        self.factories
            .get(name)
            .ok_or_else(|| HandlerError::UnknownHandler(name.to_string()))?
            .create(config)
    }
}

/// Factory for the built-in [`ProjectionHandler`], configured with
/// `{"table": "...", "sync": [...]}` or `{"table": "...", "skip": [...]}`.
pub struct ProjectionHandlerFactory;

#[derive(serde::Deserialize)]
struct ProjectionHandlerConfig {
    table: String,
    #[serde(default)]
    sync: Option<Vec<String>>,
    #[serde(default)]
    skip: Option<Vec<String>>,
}

impl HandlerFactory for ProjectionHandlerFactory {
    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn EventHandler>, HandlerError> {
        let cfg: ProjectionHandlerConfig = serde_json::from_value(config.clone())
            .map_err(|e| HandlerError::InvalidConfig(e.to_string()))?;
        let filter = match (cfg.sync, cfg.skip) {
            (Some(sync), _) => ColumnFilter::SyncOnly(sync),
            (None, Some(skip)) => ColumnFilter::Skip(skip),
            (None, None) => ColumnFilter::None,
        };
        Ok(Box::new(ProjectionHandler::new(cfg.table, filter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mymy_schema::{Column, ColumnType};
    use serde_json::json;

    fn source() -> SourceInfo {
        SourceInfo {
            schema: "city".into(),
            table: "users".into(),
            pks: vec![Column {
                index: 0,
                name: "id".into(),
                logical_type: ColumnType::Number,
                collation: None,
                is_auto: true,
                is_unsigned: true,
                is_virtual: false,
            }],
            cols: vec![
                Column::new(1, "username", ColumnType::String),
                Column::new(2, "password", ColumnType::String),
                Column::new(3, "name", ColumnType::String),
                Column::new(4, "email", ColumnType::String),
            ],
        }
    }

    #[test]
    fn insert_with_skip_projection() {
        let mut handler = ProjectionHandler::new(
            "clients",
            ColumnFilter::Skip(vec!["username".into(), "password".into()]),
        );
        let event = RowsEvent {
            action: Action::Insert,
            source: source(),
            rows: vec![vec![
                json!(1),
                json!("bob"),
                json!("12345"),
                json!("Bob"),
                json!("bob@email.com"),
            ]],
        };

        let queries = handler.on_rows(&event).unwrap();
        assert_eq!(queries.len(), 1);
        let (sql, args) = queries[0].to_sql().unwrap();
        assert_eq!(sql, "INSERT INTO clients (id,name,email) VALUES (?,?,?)");
        assert_eq!(args, vec![json!(1), json!("Bob"), json!("bob@email.com")]);
    }

    #[test]
    fn update_propagates_pk_change() {
        let mut handler = ProjectionHandler::new(
            "clients",
            ColumnFilter::Skip(vec!["username".into(), "password".into()]),
        );
        let event = RowsEvent {
            action: Action::Update,
            source: source(),
            rows: vec![
                vec![json!(1), json!("bob"), json!("12345"), json!("Bob"), json!("bob@email.com")],
                vec![json!(2), json!("bob"), json!("12345"), json!("Bobby"), json!("bob@email.com")],
            ],
        };

        let queries = handler.on_rows(&event).unwrap();
        assert_eq!(queries.len(), 1);
        let (sql, args) = queries[0].to_sql().unwrap();
        assert_eq!(sql, "UPDATE clients SET id=?, name=?, email=? WHERE id=?");
        assert_eq!(args, vec![json!(2), json!("Bobby"), json!("bob@email.com"), json!(1)]);
    }

    #[test]
    fn delete_projection() {
        let mut handler = ProjectionHandler::new("clients", ColumnFilter::None);
        let event = RowsEvent {
            action: Action::Delete,
            source: source(),
            rows: vec![vec![
                json!(1),
                json!("bob"),
                json!("12345"),
                json!("Bob"),
                json!("bob@email.com"),
            ]],
        };

        let queries = handler.on_rows(&event).unwrap();
        assert_eq!(queries.len(), 1);
        let (sql, args) = queries[0].to_sql().unwrap();
        assert_eq!(sql, "DELETE FROM clients WHERE id=?");
        assert_eq!(args, vec![json!(1)]);
    }

    #[test]
    fn odd_update_rows_is_an_error() {
        let mut handler = ProjectionHandler::new("clients", ColumnFilter::None);
        let event = RowsEvent {
            action: Action::Update,
            source: source(),
            rows: vec![vec![json!(1), json!("bob"), json!("12345"), json!("Bob"), json!("bob@email.com")]],
        };
        let err = handler.on_rows(&event).unwrap_err();
        assert!(matches!(err, HandlerError::OddUpdateRows(1)));
    }

    #[test]
    fn sync_only_takes_precedence_over_skip() {
        // Precedence is enforced by construction: ColumnFilter is one of the
        // two lists, never both, so there is no runtime ambiguity to test
        // beyond confirming SyncOnly only allows the named columns.
        let handler = ProjectionHandler::new("clients", ColumnFilter::SyncOnly(vec!["name".into()]));
        assert!(handler.is_allowed("name"));
        assert!(!handler.is_allowed("email"));
    }

    #[test]
    fn static_registry_builds_projection_handler_from_config() {
        let mut registry = StaticHandlerRegistry::new();
        registry.register("filter", Box::new(ProjectionHandlerFactory));

        let cfg = json!({"table": "clients", "skip": ["password"]});
        let handler = registry.create("filter", &cfg).unwrap();
        drop(handler);
    }

    #[test]
    fn static_registry_rejects_unknown_name() {
        let registry = StaticHandlerRegistry::new();
        let err = registry.create("nonexistent", &json!({})).unwrap_err();
        assert!(matches!(err, HandlerError::UnknownHandler(_)));
    }
}
