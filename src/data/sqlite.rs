use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use rusqlite_migration::Migrations;
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::data::{DataAccess, Query};
use crate::feed::filter::value_text;
use crate::feed::{ChangeEvent, Row};
use crate::notifier::Notifier;

/// A local stand-in for the hosted backend: tables live in SQLite, every
/// successful write is published as a `ChangeEvent`, and uploads land in a
/// directory. Rows are keyed by an `id` column, generated as a UUIDv7 when an
/// insert doesn't supply one.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    changes: Notifier<ChangeEvent>,
    upload_dir: Option<PathBuf>,
}

impl SqliteBackend {
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            changes: Notifier::new(),
            upload_dir: None,
        })
    }

    pub fn with_upload_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.upload_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn migrate(&self, migrations: &Migrations) -> Result<()> {
        let mut conn = self.lock()?;
        migrations.to_latest(&mut *conn)?;
        Ok(())
    }

    /// Every committed insert, update and delete, in commit order.
    pub fn changes(&self) -> &Notifier<ChangeEvent> {
        &self.changes
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire database lock"))
    }

    fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            anyhow::bail!("Table '{}' not found or has no columns", table);
        }
        Ok(columns)
    }

    fn fetch_row(conn: &Connection, table: &str, id: &str) -> Result<Option<Row>> {
        let sql = format!("SELECT * FROM {} WHERE id = ? LIMIT 1", quote(table));
        let mut stmt = conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_row(row, &names)?)),
            None => Ok(None),
        }
    }

    fn publish(&self, event: ChangeEvent) {
        log::debug!(
            "SQLITE CHANGE: {} on '{}' id={:?}",
            event.operation.as_str(),
            event.table,
            event.row_id()
        );
        self.changes.notify(event);
    }
}

impl DataAccess for SqliteBackend {
    fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        let conn = self.lock()?;
        let columns = Self::table_columns(&conn, table)?;
        let known = |column: &str| -> Result<()> {
            if columns.iter().any(|c| c == column) {
                Ok(())
            } else {
                anyhow::bail!("Unknown column '{}' on '{}'", column, table)
            }
        };

        let projection = if query.select.trim() == "*" {
            "*".to_string()
        } else {
            let mut selected = Vec::new();
            for column in query.select.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                if column.contains('(') {
                    anyhow::bail!("Relation projection '{}' is not supported locally", column);
                }
                known(column)?;
                selected.push(quote(column));
            }
            selected.join(", ")
        };

        let mut sql = format!("SELECT {} FROM {}", projection, quote(table));
        let mut params = Vec::new();
        if !query.filters.is_empty() {
            let mut clauses = Vec::new();
            for (column, value) in &query.filters {
                known(column.as_str())?;
                clauses.push(format!("{} = ?", quote(column)));
                params.push(to_sql(value));
            }
            sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
        }
        if let Some((column, ascending)) = &query.order {
            known(column.as_str())?;
            let direction = if *ascending { "ASC" } else { "DESC" };
            sql.push_str(&format!(" ORDER BY {} {}", quote(column), direction));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(read_row(row, &names)?);
        }
        Ok(results)
    }

    fn insert(&self, table: &str, mut row: Row) -> Result<Row> {
        let needs_id = row.get("id").and_then(value_text).map_or(true, |id| id.is_empty());
        if needs_id {
            row.insert("id".to_string(), Value::String(Uuid::now_v7().to_string()));
        }
        let id = row.get("id").and_then(value_text).context("Row has no id")?;

        let stored = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let columns = Self::table_columns(&tx, table)?;

            // Columns the table doesn't have are ignored.
            let present: Vec<(&String, &Value)> = row
                .iter()
                .filter(|(name, _)| columns.iter().any(|c| c == *name))
                .collect();
            let names: Vec<String> = present.iter().map(|(name, _)| quote(name)).collect();
            let placeholders = vec!["?"; present.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(table),
                names.join(", "),
                placeholders
            );
            let values: Vec<SqlValue> = present.iter().map(|(_, value)| to_sql(value)).collect();
            tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;

            let stored = Self::fetch_row(&tx, table, &id)?
                .with_context(|| format!("Inserted row {} not readable", id))?;
            tx.commit()?;
            stored
        }; // Lock released here

        self.publish(ChangeEvent::insert(table, stored.clone()));
        Ok(stored)
    }

    fn update(&self, table: &str, id: &str, patch: Row) -> Result<()> {
        let (old, new) = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let columns = Self::table_columns(&tx, table)?;
            let old = Self::fetch_row(&tx, table, id)?
                .with_context(|| format!("No row {} in '{}'", id, table))?;

            let present: Vec<(&String, &Value)> = patch
                .iter()
                .filter(|(name, _)| *name != "id" && columns.iter().any(|c| c == *name))
                .collect();
            if present.is_empty() {
                return Ok(()); // Nothing to update
            }

            let set_clauses: Vec<String> = present
                .iter()
                .map(|(name, _)| format!("{} = ?", quote(name)))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE id = ?",
                quote(table),
                set_clauses.join(", ")
            );
            let mut values: Vec<SqlValue> = present.iter().map(|(_, value)| to_sql(value)).collect();
            values.push(SqlValue::Text(id.to_string()));
            tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;

            let new = Self::fetch_row(&tx, table, id)?
                .with_context(|| format!("Updated row {} not readable", id))?;
            tx.commit()?;
            (old, new)
        };

        self.publish(ChangeEvent::update(table, old, new));
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> Result<()> {
        let old = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            Self::table_columns(&tx, table)?;
            let Some(old) = Self::fetch_row(&tx, table, id)? else {
                return Ok(());
            };
            tx.execute(&format!("DELETE FROM {} WHERE id = ?", quote(table)), [id])?;
            tx.commit()?;
            old
        };

        self.publish(ChangeEvent::delete(table, old));
        Ok(())
    }

    fn upload_file(&self, bucket: &str, path: &str, content: &[u8]) -> Result<String> {
        let base = self
            .upload_dir
            .as_ref()
            .context("No upload directory configured")?;
        let full_path = base.join(bucket).join(path);
        log::debug!("STORAGE PUT: path='{}', size={} bytes", full_path.display(), content.len());
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full_path, content)?;
        let absolute = full_path.canonicalize()?;
        let url = Url::from_file_path(&absolute)
            .map_err(|_| anyhow::anyhow!("Cannot build URL for {}", absolute.display()))?;
        Ok(url.to_string())
    }

    fn tables(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(names.collect::<Result<Vec<_>, _>>()?)
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn read_row(row: &rusqlite::Row, names: &[String]) -> Result<Row> {
    let mut out = Row::new();
    for (index, name) in names.iter().enumerate() {
        let value = match row.get_ref(index)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
            ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::from(bytes.to_vec()),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}
