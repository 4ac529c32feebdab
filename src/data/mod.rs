use anyhow::Result;
use serde_json::Value;

use crate::feed::Row;

pub use rest::RestClient;
pub use sqlite::SqliteBackend;

pub mod rest;
pub mod sqlite;

/// Read parameters for a table: projection, equality filters, one sort key
/// and a row limit.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// Column list in the backend's select syntax. Remote backends accept
    /// nested relations such as `*, customers (id, name)`.
    pub select: String,
    pub filters: Vec<(String, Value)>,
    /// Column and whether the sort is ascending.
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            select: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, select: &str) -> Self {
        self.select = select.to_string();
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Request/response access to the backend's tables and object storage.
pub trait DataAccess: Send + Sync {
    fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>>;

    /// Inserts `row` and returns it as stored, including generated columns.
    fn insert(&self, table: &str, row: Row) -> Result<Row>;

    fn update(&self, table: &str, id: &str, patch: Row) -> Result<()>;

    fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// Stores `content` under `bucket/path` and returns a URL it can be
    /// fetched from.
    fn upload_file(&self, bucket: &str, path: &str, content: &[u8]) -> Result<String>;

    /// Names of the tables this backend serves.
    fn tables(&self) -> Result<Vec<String>>;
}
