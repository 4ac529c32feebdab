use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FeedError;
use crate::feed::filter::{value_text, RowFilter};

/// A row as the backend reports it: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    /// Only meaningful as a subscription filter.
    #[serde(rename = "*")]
    All,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::All => "*",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            "*" => Some(Operation::All),
            _ => None,
        }
    }

    /// True when a subscription filtered on `self` wants an event of `other`.
    pub fn accepts(&self, other: Operation) -> bool {
        *self == Operation::All || *self == other
    }
}

/// One row-level mutation reported by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub table: String,
    pub new_row: Option<Row>,
    pub old_row: Option<Row>,
}

impl ChangeEvent {
    /// Builds an event, rejecting row combinations the operation can't have:
    /// INSERT carries only `new_row`, DELETE only `old_row`, UPDATE both.
    pub fn new(
        operation: Operation,
        table: impl Into<String>,
        new_row: Option<Row>,
        old_row: Option<Row>,
    ) -> Result<Self> {
        let table = table.into();
        let shape_ok = match operation {
            Operation::Insert => new_row.is_some() && old_row.is_none(),
            Operation::Update => new_row.is_some() && old_row.is_some(),
            Operation::Delete => new_row.is_none() && old_row.is_some(),
            Operation::All => false,
        };
        if !shape_ok {
            return Err(FeedError::MalformedEvent(format!(
                "{} on '{}' with new_row={} old_row={}",
                operation.as_str(),
                table,
                new_row.is_some(),
                old_row.is_some()
            ))
            .into());
        }
        Ok(Self {
            operation,
            table,
            new_row,
            old_row,
        })
    }

    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            operation: Operation::Insert,
            table: table.into(),
            new_row: Some(row),
            old_row: None,
        }
    }

    pub fn update(table: impl Into<String>, old_row: Row, new_row: Row) -> Self {
        Self {
            operation: Operation::Update,
            table: table.into(),
            new_row: Some(new_row),
            old_row: Some(old_row),
        }
    }

    pub fn delete(table: impl Into<String>, old_row: Row) -> Self {
        Self {
            operation: Operation::Delete,
            table: table.into(),
            new_row: None,
            old_row: Some(old_row),
        }
    }

    /// The row that identifies this change: the new state, or the old one for
    /// deletes.
    pub fn row(&self) -> Option<&Row> {
        self.new_row.as_ref().or(self.old_row.as_ref())
    }

    pub fn row_id(&self) -> Option<String> {
        self.row().and_then(|row| row.get("id")).and_then(value_text)
    }
}

/// What a channel listens to: a table, an operation (or `All`) and an
/// optional equality predicate on the row.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSpec {
    pub channel: String,
    pub table: String,
    pub operation: Operation,
    pub filter: Option<RowFilter>,
}

impl ChannelSpec {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.operation.accepts(event.operation) {
            return false;
        }
        match (&self.filter, event.row()) {
            (None, _) => true,
            (Some(filter), Some(row)) => filter.matches(row),
            (Some(_), None) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn rejects_rows_that_contradict_the_operation() {
        let err = ChangeEvent::new(Operation::Insert, "orders", None, Some(row(json!({"id": 1}))))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FeedError>(),
            Some(FeedError::MalformedEvent(_))
        ));
        assert!(ChangeEvent::new(Operation::Update, "orders", Some(row(json!({"id": 1}))), None).is_err());
        assert!(ChangeEvent::new(Operation::All, "orders", Some(row(json!({}))), None).is_err());
        assert!(ChangeEvent::new(Operation::Delete, "orders", None, Some(row(json!({"id": 1})))).is_ok());
    }

    #[test]
    fn row_id_falls_back_to_old_row_for_deletes() {
        let deleted = ChangeEvent::delete("orders", row(json!({"id": 42})));
        assert_eq!(deleted.row_id().as_deref(), Some("42"));

        let inserted = ChangeEvent::insert("orders", row(json!({"id": "abc123"})));
        assert_eq!(inserted.row_id().as_deref(), Some("abc123"));
    }

    #[test]
    fn operation_wildcard_accepts_everything() {
        assert!(Operation::All.accepts(Operation::Delete));
        assert!(Operation::Insert.accepts(Operation::Insert));
        assert!(!Operation::Insert.accepts(Operation::Update));
        assert_eq!(Operation::parse("update"), Some(Operation::Update));
        assert_eq!(Operation::parse("upsert"), None);
    }

    #[test]
    fn channel_spec_applies_table_operation_and_filter() -> Result<()> {
        let spec = ChannelSpec {
            channel: "order_notifications".to_string(),
            table: "orders".to_string(),
            operation: Operation::Insert,
            filter: Some(RowFilter::parse("source=eq.website")?),
        };
        let website = ChangeEvent::insert("orders", row(json!({"id": 1, "source": "website"})));
        let admin = ChangeEvent::insert("orders", row(json!({"id": 2, "source": "admin"})));
        let other_table = ChangeEvent::insert("customers", row(json!({"id": 3, "source": "website"})));

        assert!(spec.matches(&website));
        assert!(!spec.matches(&admin));
        assert!(!spec.matches(&other_table));
        Ok(())
    }
}
