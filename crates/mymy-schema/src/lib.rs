//! Shared source-table schema types: [`Column`], [`SourceInfo`], and the
//! [`RowsEvent`] a producer delivers to a rule's handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mymy_query::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Number,
    Float,
    Enum,
    Set,
    String,
    Datetime,
    Timestamp,
    Date,
    Time,
    Bit,
    Json,
    Decimal,
    MediumInt,
    Binary,
    Point,
}

/// `index` is the position in the wire row tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub index: usize,
    pub name: String,
    pub logical_type: ColumnType,
    pub collation: Option<String>,
    pub is_auto: bool,
    pub is_unsigned: bool,
    pub is_virtual: bool,
}

impl Column {
    pub fn new(index: usize, name: impl Into<String>, logical_type: ColumnType) -> Self {
        Column {
            index,
            name: name.into(),
            logical_type,
            collation: None,
            is_auto: false,
            is_unsigned: false,
            is_virtual: false,
        }
    }

    pub fn value<'a>(&self, row: &'a [Value]) -> Result<&'a Value, ColumnError> {
        row.get(self.index).ok_or(ColumnError::IndexOutOfRange {
            index: self.index,
            row_len: row.len(),
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ColumnError {
    #[error("column index ({index}) equals or exceeds row length ({row_len})")]
    IndexOutOfRange { index: usize, row_len: usize },
    #[error("column not found")]
    NotFound,
}

/// `len(pks) >= 1` is enforced by the caller at rule-registration time, not
/// by this type itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub schema: String,
    pub table: String,
    pub pks: Vec<Column>,
    pub cols: Vec<Column>,
}

impl SourceInfo {
    pub fn find_column_by_name(&self, name: &str) -> Result<&Column, ColumnError> {
        self.pks
            .iter()
            .chain(self.cols.iter())
            .find(|c| c.name == name)
            .ok_or(ColumnError::NotFound)
    }
}

/// `RuleKey(schema, table) = "schema:table"`.
pub fn rule_key(schema: &str, table: &str) -> String {
    let mut key = String::with_capacity(schema.len() + table.len() + 1);
    key.push_str(schema);
    key.push(':');
    key.push_str(table);
    key
}

/// For `update`, `len(rows)` is even and pairs are `(before, after)` in
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsEvent {
    pub action: Action,
    pub source: SourceInfo,
    pub rows: Vec<Vec<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_key_joins_schema_and_table() {
        assert_eq!(rule_key("city", "users"), "city:users");
    }

    #[test]
    fn find_column_by_name_checks_pks_then_cols() {
        let info = SourceInfo {
            schema: "city".into(),
            table: "users".into(),
            pks: vec![Column::new(0, "id", ColumnType::Number)],
            cols: vec![Column::new(1, "name", ColumnType::String)],
        };
        assert_eq!(info.find_column_by_name("id").unwrap().index, 0);
        assert_eq!(info.find_column_by_name("name").unwrap().index, 1);
        assert_eq!(info.find_column_by_name("missing").unwrap_err(), ColumnError::NotFound);
    }
}
