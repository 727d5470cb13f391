//! Record storage used by the pipeline services.
//!
//! The services only need two operations: filtered, sorted, limited reads
//! and inserts that stamp an id and creation time. [`MemoryDatabase`] keeps
//! tables in process, each capped at a row count with the oldest rows evicted.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// One stored row.
pub type Record = serde_json::Map<String, Value>;

/// Column stamped on every insert.
pub const CREATED_AT: &str = "created_at";

pub const TELEMETRY: &str = "telemetry";
pub const ANOMALIES: &str = "anomalies";
pub const PREDICTIONS: &str = "predictions";
pub const ALERTS: &str = "alerts";

/// Tables the pipeline writes to.
pub const TABLES: &[&str] = &[TELEMETRY, ANOMALIES, PREDICTIONS, ALERTS];

/// Rows kept per table by [`MemoryDatabase::default`].
pub const DEFAULT_ROW_CAP: usize = 10_000;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("table '{0}' does not exist")]
    UnknownTable(String),

    #[error("invalid record for '{table}': {message}")]
    InvalidRecord { table: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Read filter: field equality, an optional lower time bound, sort and limit.
#[derive(Debug, Clone, Default)]
pub struct Query {
    equals: Vec<(String, Value)>,
    since: Option<(String, DateTime<Utc>)>,
    sort: Option<(String, SortOrder)>,
    limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    /// Keep rows whose RFC 3339 `field` is at or after `at`.
    pub fn since(mut self, field: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.since = Some((field.into(), at));
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &Record) -> bool {
        let equal = self
            .equals
            .iter()
            .all(|(field, value)| record.get(field) == Some(value));
        let recent = match &self.since {
            Some((field, at)) => record
                .get(field)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .is_some_and(|ts| ts.with_timezone(&Utc) >= *at),
            None => true,
        };
        equal && recent
    }
}

#[async_trait]
pub trait Database: Send + Sync + std::fmt::Debug {
    /// Rows of `table` matching `query`, in the requested order.
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Record>, DbError>;

    /// Store `record`, returning it with its generated `id` and `created_at`.
    async fn insert(&self, table: &str, record: Record) -> Result<Record, DbError>;
}

/// Tables held in memory; rows keep insertion order.
///
/// Each table holds at most `row_cap` rows. An insert past the cap evicts
/// the oldest row.
#[derive(Debug)]
pub struct MemoryDatabase {
    tables: RwLock<HashMap<String, VecDeque<Record>>>,
    row_cap: usize,
}

impl MemoryDatabase {
    /// A database with the given (empty) tables.
    pub fn with_tables(tables: &[&str]) -> Self {
        Self {
            tables: RwLock::new(
                tables
                    .iter()
                    .map(|t| (t.to_string(), VecDeque::new()))
                    .collect(),
            ),
            row_cap: DEFAULT_ROW_CAP,
        }
    }

    /// Keep at most `cap` rows per table (at least one).
    pub fn with_row_cap(mut self, cap: usize) -> Self {
        self.row_cap = cap.max(1);
        self
    }

    pub fn row_cap(&self) -> usize {
        self.row_cap
    }

    /// Row count of `table` (0 when it does not exist).
    pub async fn count(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, VecDeque::len)
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::with_tables(TABLES)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Record>, DbError> {
        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))?;

        let mut out: Vec<Record> = rows.iter().filter(|r| query.matches(r)).cloned().collect();
        if let Some((field, order)) = &query.sort {
            match order {
                SortOrder::Ascending => {
                    out.sort_by(|a, b| compare_values(a.get(field), b.get(field)));
                }
                // Ties keep the most recently inserted row first.
                SortOrder::Descending => {
                    out.reverse();
                    out.sort_by(|a, b| compare_values(b.get(field), a.get(field)));
                }
            }
        }
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn insert(&self, table: &str, mut record: Record) -> Result<Record, DbError> {
        if record.contains_key("id") {
            return Err(DbError::InvalidRecord {
                table: table.to_string(),
                message: "ids are generated on insert".to_string(),
            });
        }
        let mut tables = self.tables.write().await;
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))?;

        let id = Uuid::new_v4().to_string();
        record.insert("id".to_string(), Value::from(id.as_str()));
        record
            .entry(CREATED_AT)
            .or_insert_with(|| Value::from(timestamp(Utc::now())));
        rows.push_back(record.clone());
        while rows.len() > self.row_cap {
            rows.pop_front();
        }
        debug!(table, id = %id, rows = rows.len(), "record inserted");
        Ok(record)
    }
}

/// RFC 3339 with fixed precision and `Z`, so stored timestamps sort as strings.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Numbers compare numerically, strings lexically, missing values first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
