use std::sync::mpsc::Receiver;

use anyhow::Result;
use serde_json::Value;

use crate::data::{DataAccess, Query};
use crate::feed::filter::value_text;
use crate::feed::{ChangeEvent, Operation, Row};
use crate::notifier::Notifier;
use crate::views::ViewEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    Inserted,
    Updated,
    Removed,
    /// The event doesn't concern a loaded row, or the row is already in the
    /// state it describes.
    Ignored,
    /// The event lacks columns the view depends on; the view needs a reload.
    Refused,
}

/// Rows of one table kept in sync by writing change events straight into
/// them. Updates overwrite scalar columns with their new values, so applying
/// the same event twice has the same effect as applying it once.
pub struct PatchView {
    table: String,
    rows: Vec<Row>,
    required_columns: Vec<String>,
    changes: Notifier<ViewEvent>,
}

impl PatchView {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            rows: Vec::new(),
            required_columns: Vec::new(),
            changes: Notifier::new(),
        }
    }

    /// Columns every applied row must carry. Events from the change feed only
    /// hold the table's own columns, so a view built on joined fields should
    /// list them here and will refuse those events.
    pub fn requiring<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Replaces the loaded rows.
    pub fn load(&mut self, rows: Vec<Row>) {
        self.rows = rows;
    }

    pub fn fetch(&mut self, data: &dyn DataAccess, query: &Query) -> Result<usize> {
        let rows = data.query(&self.table, query)?;
        let count = rows.len();
        self.load(rows);
        Ok(count)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn get(&self, id: &str) -> Option<&Row> {
        self.position(id).map(|index| &self.rows[index])
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.get("id").and_then(value_text).as_deref() == Some(id))
    }

    fn missing_column(&self, row: &Row) -> Option<&str> {
        self.required_columns
            .iter()
            .find(|column| !row.contains_key(column.as_str()))
            .map(String::as_str)
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> PatchOutcome {
        if event.table != self.table {
            return PatchOutcome::Ignored;
        }
        let Some(id) = event.row_id() else {
            log::warn!("Change on '{}' without a row id, ignored", self.table);
            return PatchOutcome::Ignored;
        };

        let outcome = match (event.operation, event.new_row.as_ref()) {
            (Operation::Delete, _) => match self.position(&id) {
                Some(index) => {
                    self.rows.remove(index);
                    PatchOutcome::Removed
                }
                None => PatchOutcome::Ignored,
            },
            (Operation::Insert, Some(row)) => {
                if let Some(column) = self.missing_column(row) {
                    log::debug!("Insert of {} lacks '{}', refused", id, column);
                    PatchOutcome::Refused
                } else if self.position(&id).is_some() {
                    PatchOutcome::Ignored
                } else {
                    self.rows.insert(0, row.clone());
                    PatchOutcome::Inserted
                }
            }
            (Operation::Update, Some(row)) => match self.position(&id) {
                None => PatchOutcome::Ignored,
                Some(_) if self.missing_column(row).is_some() => PatchOutcome::Refused,
                Some(index) => {
                    overwrite_scalars(&mut self.rows[index], row);
                    PatchOutcome::Updated
                }
            },
            _ => PatchOutcome::Ignored,
        };

        match outcome {
            PatchOutcome::Inserted | PatchOutcome::Updated => {
                self.changes.notify(ViewEvent::RowChanged(id));
            }
            PatchOutcome::Removed => {
                self.changes.notify(ViewEvent::RowRemoved(id));
            }
            PatchOutcome::Refused => {
                log::warn!("'{}' view can't be patched from this event", self.table);
            }
            PatchOutcome::Ignored => {}
        }
        outcome
    }

    /// Optimistic local edit, e.g. a status picked in a dropdown before the
    /// write reaches the backend. Returns false if the row isn't loaded.
    pub fn set_field(&mut self, id: &str, column: &str, value: impl Into<Value>) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        self.rows[index].insert(column.to_string(), value.into());
        self.changes.notify(ViewEvent::RowChanged(id.to_string()));
        true
    }

    pub fn observer(&self) -> Receiver<ViewEvent> {
        self.changes.observer()
    }
}

/// Nested values are joined data the event can't know about; they're kept.
fn overwrite_scalars(target: &mut Row, source: &Row) {
    for (column, value) in source {
        if value.is_object() || value.is_array() {
            continue;
        }
        target.insert(column.clone(), value.clone());
    }
}
