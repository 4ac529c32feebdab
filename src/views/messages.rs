use std::fmt;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::{DataAccess, Query};
use crate::feed::Row;
use crate::views::reload::Loader;

/// Table the contact form on the storefront writes to.
pub const CONTACT_MESSAGES: &str = "contact_messages";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    New,
    Read,
    Replied,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::New => "new",
            MessageStatus::Read => "read",
            MessageStatus::Replied => "replied",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "new" => Some(MessageStatus::New),
            "read" => Some(MessageStatus::Read),
            "replied" => Some(MessageStatus::Replied),
            _ => None,
        }
    }

    /// Messages without a recognised status are shown as new.
    pub fn of(message: &Row) -> Self {
        message
            .get("status")
            .and_then(Value::as_str)
            .and_then(Self::parse)
            .unwrap_or(MessageStatus::New)
    }

    /// Columns to write when a message is moved to this status at `at`.
    pub fn update_row(&self, at: DateTime<Utc>) -> Row {
        let mut row = Row::new();
        row.insert("status".to_string(), Value::from(self.as_str()));
        let stamp = Value::from(at.to_rfc3339_opts(SecondsFormat::Millis, true));
        match self {
            MessageStatus::Read => {
                row.insert("read_at".to_string(), stamp);
            }
            MessageStatus::Replied => {
                row.insert("replied_at".to_string(), stamp);
            }
            MessageStatus::New => {}
        }
        row
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The messages screen: contact messages newest first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessagesModel {
    pub messages: Vec<Row>,
}

impl MessagesModel {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn count(&self, status: MessageStatus) -> usize {
        self.messages
            .iter()
            .filter(|message| MessageStatus::of(message) == status)
            .count()
    }
}

/// Loads `MessagesModel`, narrowed to one status unless showing all. The
/// filter goes to the backend, so changing it means mounting a new view.
#[derive(Clone, Debug, Default)]
pub struct MessagesLoader {
    status: Option<MessageStatus>,
}

impl MessagesLoader {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    pub fn status(&self) -> Option<MessageStatus> {
        self.status
    }
}

impl Loader for MessagesLoader {
    type Model = MessagesModel;

    fn load(&self, data: &dyn DataAccess) -> Result<MessagesModel> {
        let mut query = Query::new().order("created_at", false);
        if let Some(status) = self.status {
            query = query.eq("status", status.as_str());
        }
        let messages = data.query(CONTACT_MESSAGES, &query)?;
        log::debug!(
            "Loaded {} messages ({})",
            messages.len(),
            self.status.map_or("all", |s| s.as_str())
        );
        Ok(MessagesModel { messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SqliteBackend;
    use chrono::TimeZone;
    use rusqlite_migration::{Migrations, M};
    use serde_json::json;

    fn seeded() -> Result<SqliteBackend> {
        let backend = SqliteBackend::open_memory()?;
        backend.migrate(&Migrations::new(vec![M::up(
            "CREATE TABLE contact_messages (
                id TEXT NOT NULL PRIMARY KEY, name TEXT, phone TEXT, message TEXT,
                status TEXT, read_at TEXT, replied_at TEXT, created_at TEXT);",
        )]))?;
        for (id, status, created_at) in [
            ("m1", "new", "2026-03-01T09:00:00Z"),
            ("m2", "read", "2026-03-02T09:00:00Z"),
            ("m3", "new", "2026-03-03T09:00:00Z"),
            ("m4", "replied", "2026-03-04T09:00:00Z"),
        ] {
            backend.insert(
                CONTACT_MESSAGES,
                json!({"id": id, "name": "Aziz", "status": status, "created_at": created_at})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )?;
        }
        Ok(backend)
    }

    #[test]
    fn loads_newest_first() -> Result<()> {
        let model = MessagesLoader::all().load(&seeded()?)?;
        let ids: Vec<&str> = model.messages.iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["m4", "m3", "m2", "m1"]);
        assert_eq!(model.count(MessageStatus::New), 2);
        assert_eq!(model.count(MessageStatus::Replied), 1);
        Ok(())
    }

    #[test]
    fn status_filter_goes_to_the_backend() -> Result<()> {
        let backend = seeded()?;
        let model = MessagesLoader::with_status(MessageStatus::New).load(&backend)?;
        assert_eq!(model.len(), 2);
        assert_eq!(model.messages[0]["id"], "m3");

        let model = MessagesLoader::with_status(MessageStatus::Read).load(&backend)?;
        assert_eq!(model.len(), 1);
        assert_eq!(model.count(MessageStatus::Read), 1);
        Ok(())
    }

    #[test]
    fn status_changes_stamp_the_time() {
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 8, 30, 0).unwrap();
        let read = MessageStatus::Read.update_row(at);
        assert_eq!(read["status"], "read");
        assert_eq!(read["read_at"], "2026-03-10T08:30:00.000Z");
        assert!(!read.contains_key("replied_at"));

        let replied = MessageStatus::Replied.update_row(at);
        assert_eq!(replied["replied_at"], "2026-03-10T08:30:00.000Z");
        assert_eq!(MessageStatus::New.update_row(at).len(), 1);

        assert_eq!(MessageStatus::parse("archived"), None);
        let unknown = json!({"status": "archived"}).as_object().cloned().unwrap();
        assert_eq!(MessageStatus::of(&unknown), MessageStatus::New);
    }
}
