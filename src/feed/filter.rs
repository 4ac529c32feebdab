use anyhow::Result;
use serde_json::Value;

use crate::error::FeedError;
use crate::feed::Row;

/// Equality predicate in the backend's filter syntax, e.g. `source=eq.website`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || FeedError::InvalidFilter(text.to_string());
        let (column, predicate) = text.split_once('=').ok_or_else(invalid)?;
        let value = predicate.strip_prefix("eq.").ok_or_else(invalid)?;
        let column = column.trim();
        if column.is_empty() {
            return Err(invalid().into());
        }
        Ok(Self {
            column: column.to_string(),
            value: value.to_string(),
        })
    }

    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column)
            .and_then(value_text)
            .is_some_and(|text| text == self.value)
    }

    /// Renders back to the wire form.
    pub fn to_wire(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }
}

/// Textual form of a scalar column value, as used for ids and filter
/// comparisons. `null` has none.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
