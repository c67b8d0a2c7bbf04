//! Canonical representation of an insert/update/delete plus serialisation to
//! parameterised SQL.
//!
//! The WHERE-clause separator is deliberately `, ` rather than `AND` — see
//! the doc comment on [`Query::to_sql`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

/// One `field = value` pair, used for both the SET list and the WHERE list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryArg {
    pub field: String,
    pub value: Value,
}

impl QueryArg {
    pub fn new(field: impl Into<String>, value: Value) -> Self {
        QueryArg {
            field: field.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub action: Action,
    pub table: String,
    pub values: Vec<QueryArg>,
    pub where_: Vec<QueryArg>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query builder: empty table")]
    EmptyTable,
    #[error("query builder: empty values")]
    EmptyValues,
    #[error("query builder: empty where clause")]
    EmptyWhere,
    #[error("unknown action type")]
    UnknownAction,
}

impl Query {
    pub fn insert(table: impl Into<String>, values: Vec<QueryArg>) -> Self {
        Query {
            action: Action::Insert,
            table: table.into(),
            values,
            where_: Vec::new(),
        }
    }

    pub fn update(table: impl Into<String>, values: Vec<QueryArg>, where_: Vec<QueryArg>) -> Self {
        Query {
            action: Action::Update,
            table: table.into(),
            values,
            where_,
        }
    }

    pub fn delete(table: impl Into<String>, where_: Vec<QueryArg>) -> Self {
        Query {
            action: Action::Delete,
            table: table.into(),
            values: Vec::new(),
            where_,
        }
    }

    /// Render the canonical parameterised SQL and its positional argument
    /// list. The WHERE separator is `, ` (not `AND`) — consistent with the
    /// source system's own tests, and relied upon by its supported case of
    /// single-column primary keys. Multi-column primary keys would produce
    /// malformed SQL on some dialects with this separator; this core does
    /// not special-case that (see the design notes' Open Question
    /// resolution).
    pub fn to_sql(&self) -> Result<(String, Vec<Value>), QueryError> {
        match self.action {
            Action::Insert => self.to_insert_sql(),
            Action::Update => self.to_update_sql(),
            Action::Delete => self.to_delete_sql(),
        }
    }

    fn to_insert_sql(&self) -> Result<(String, Vec<Value>), QueryError> {
        if self.table.is_empty() {
            return Err(QueryError::EmptyTable);
        }
        if self.values.is_empty() {
            return Err(QueryError::EmptyValues);
        }

        let fields: Vec<&str> = self.values.iter().map(|a| a.field.as_str()).collect();
        let placeholders = vec!["?"; self.values.len()].join(",");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            fields.join(","),
            placeholders
        );
        let args = self.values.iter().map(|a| a.value.clone()).collect();
        Ok((sql, args))
    }

    fn to_update_sql(&self) -> Result<(String, Vec<Value>), QueryError> {
        if self.table.is_empty() {
            return Err(QueryError::EmptyTable);
        }
        if self.values.is_empty() {
            return Err(QueryError::EmptyValues);
        }
        if self.where_.is_empty() {
            return Err(QueryError::EmptyWhere);
        }

        let set_clause = self
            .values
            .iter()
            .map(|a| format!("{}=?", a.field))
            .collect::<Vec<_>>()
            .join(", ");
        let where_clause = self
            .where_
            .iter()
            .map(|a| format!("{}=?", a.field))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE {} SET {} WHERE {}", self.table, set_clause, where_clause);

        let mut args: Vec<Value> = self.values.iter().map(|a| a.value.clone()).collect();
        args.extend(self.where_.iter().map(|a| a.value.clone()));
        Ok((sql, args))
    }

    fn to_delete_sql(&self) -> Result<(String, Vec<Value>), QueryError> {
        if self.table.is_empty() {
            return Err(QueryError::EmptyTable);
        }
        if self.where_.is_empty() {
            return Err(QueryError::EmptyWhere);
        }

        let where_clause = self
            .where_
            .iter()
            .map(|a| format!("{}=?", a.field))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("DELETE FROM {} WHERE {}", self.table, where_clause);
        let args = self.where_.iter().map(|a| a.value.clone()).collect();
        Ok((sql, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_sql_literal_match() {
        let q = Query::insert(
            "clients",
            vec![
                QueryArg::new("id", json!(1)),
                QueryArg::new("name", json!("Bob")),
                QueryArg::new("email", json!("bob@email.com")),
            ],
        );
        let (sql, args) = q.to_sql().unwrap();
        assert_eq!(sql, "INSERT INTO clients (id,name,email) VALUES (?,?,?)");
        assert_eq!(args, vec![json!(1), json!("Bob"), json!("bob@email.com")]);
    }

    #[test]
    fn update_sql_literal_match() {
        let q = Query::update(
            "clients",
            vec![
                QueryArg::new("id", json!(2)),
                QueryArg::new("name", json!("Bobby")),
                QueryArg::new("email", json!("bob@email.com")),
            ],
            vec![QueryArg::new("id", json!(1))],
        );
        let (sql, args) = q.to_sql().unwrap();
        assert_eq!(sql, "UPDATE clients SET id=?, name=?, email=? WHERE id=?");
        assert_eq!(
            args,
            vec![json!(2), json!("Bobby"), json!("bob@email.com"), json!(1)]
        );
    }

    #[test]
    fn delete_sql_literal_match() {
        let q = Query::delete("clients", vec![QueryArg::new("id", json!(1))]);
        let (sql, args) = q.to_sql().unwrap();
        assert_eq!(sql, "DELETE FROM clients WHERE id=?");
        assert_eq!(args, vec![json!(1)]);
    }

    #[test]
    fn insert_rejects_empty_table() {
        let q = Query::insert("", vec![QueryArg::new("id", json!(1))]);
        assert_eq!(q.to_sql().unwrap_err(), QueryError::EmptyTable);
    }

    #[test]
    fn insert_rejects_empty_values() {
        let q = Query::insert("clients", vec![]);
        assert_eq!(q.to_sql().unwrap_err(), QueryError::EmptyValues);
    }

    #[test]
    fn update_rejects_empty_where() {
        let q = Query::update("clients", vec![QueryArg::new("id", json!(1))], vec![]);
        assert_eq!(q.to_sql().unwrap_err(), QueryError::EmptyWhere);
    }

    #[test]
    fn delete_rejects_empty_where() {
        let q = Query::delete("clients", vec![]);
        assert_eq!(q.to_sql().unwrap_err(), QueryError::EmptyWhere);
    }
}
