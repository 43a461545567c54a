use std::{path::Path, sync::Arc};

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use telemetry_memorizer::Record;
use tracing::debug;

use super::{MetricSink, SinkError, SinkFuture};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    value REAL NOT NULL,
    timestamp INTEGER NOT NULL,
    tags TEXT NOT NULL,
    project_name TEXT NOT NULL,
    hostname TEXT NOT NULL,
    os TEXT NOT NULL,
    unique_id TEXT NOT NULL,
    unit TEXT NOT NULL
)";

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_metrics_name_timestamp ON metrics(name, timestamp DESC)";

const INSERT: &str = "INSERT INTO metrics
    (name, type, value, timestamp, tags, project_name, hostname, os, unique_id, unit)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

/// Metric sink writing one row per record into a SQLite `metrics` table.
///
/// Tags are stored as a JSON array.  Each batch is written in a single transaction.
#[derive(Clone)]
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Opens, or creates, the database at the given path.
    ///
    /// # Errors
    ///
    /// If the database could not be opened or its schema could not be created, an error variant
    /// will be returned.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// Creates a sink backed by a private in-memory database.
    ///
    /// # Errors
    ///
    /// If the schema could not be created, an error variant will be returned.
    pub fn in_memory() -> Result<Self, SinkError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SinkError> {
        conn.execute(CREATE_TABLE, [])?;
        conn.execute(CREATE_INDEX, [])?;
        Ok(SqliteSink { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Gets the number of rows in the `metrics` table.
    ///
    /// # Errors
    ///
    /// If the table could not be queried, an error variant will be returned.
    pub fn row_count(&self) -> Result<usize, SinkError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

fn insert(conn: &mut Connection, records: &[Record]) -> Result<usize, SinkError> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(INSERT)?;
        for record in records {
            let tags = serde_json::to_string(&record.tags)?;
            stmt.execute(params![
                record.name,
                record.kind,
                record.value,
                record.timestamp,
                tags,
                record.project_name,
                record.hostname,
                record.os,
                record.emitter_id,
                record.unit,
            ])?;
        }
    }
    tx.commit()?;

    Ok(records.len())
}

impl MetricSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn write_metrics<'a>(&'a self, records: &'a [Record]) -> SinkFuture<'a> {
        Box::pin(async move {
            if records.is_empty() {
                return Ok(0);
            }

            let conn = Arc::clone(&self.conn);
            let records = records.to_vec();
            let written =
                tokio::task::spawn_blocking(move || insert(&mut conn.lock(), &records)).await??;

            debug!(rows = written, "Wrote metrics to SQLite.");
            Ok(written)
        })
    }
}
