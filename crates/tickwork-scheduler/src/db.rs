use std::path::Path;
use std::sync::Mutex;

use rusqlite::{types::Value as SqlValue, Connection, Row};
use tracing::{info, warn};

use crate::error::{Result, SchedulerError};
use crate::mirror::JobMirror;
use crate::types::{FieldUpdate, JobRecord, Millis};

const SELECT_COLUMNS: &str = "SELECT id, schedule_time, handler_name, data, status, created_at,
        retry_strategy, recurring, cron_expression, interval_ms, executed_at,
        last_error, retry_count
 FROM jobs";

/// Initialise the mirror schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and an index on `schedule_time`,
/// which serves as the sorted due-index for recovery and `get_due` queries.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            schedule_time   INTEGER NOT NULL,   -- epoch ms
            handler_name    TEXT    NOT NULL,
            data            TEXT    NOT NULL DEFAULT '{}',  -- JSON payload
            status          TEXT    NOT NULL DEFAULT 'pending',
            created_at      INTEGER NOT NULL,
            retry_strategy  TEXT,               -- JSON or NULL
            recurring       INTEGER NOT NULL DEFAULT 0,
            cron_expression TEXT,
            interval_ms     INTEGER,
            executed_at     INTEGER,
            last_error      TEXT,
            retry_count     INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_schedule_time ON jobs (schedule_time);
        ",
    )?;
    Ok(())
}

/// SQLite-backed [`JobMirror`].
///
/// Owns one connection with an explicit lifecycle: `open`, use, `close`.
pub struct SqliteMirror {
    conn: Mutex<Option<Connection>>,
}

impl SqliteMirror {
    /// Open (or create) the database file at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.as_ref().display(), "job mirror opened");
        Self::from_connection(conn)
    }

    /// Private in-memory database. Not durable; intended for tests and demos.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an already-open connection, initialising the schema.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().expect("mirror connection poisoned");
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(SchedulerError::Persistence("job mirror is closed".into())),
        }
    }

    fn query_records(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<JobRecord>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let records = stmt
            .query_map(params, row_to_record)?
            .filter_map(|r| match r {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("skipping unreadable job row: {e}");
                    None
                }
            })
            .collect();
        Ok(records)
    }
}

impl JobMirror for SqliteMirror {
    fn put(&self, record: &JobRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO jobs
                 (id, schedule_time, handler_name, data, status, created_at,
                  retry_strategy, recurring, cron_expression, interval_ms,
                  executed_at, last_error, retry_count)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                rusqlite::params![
                    record.id,
                    record.schedule_time,
                    record.handler_name,
                    record.data,
                    record.status,
                    record.created_at,
                    record.retry_strategy,
                    record.recurring,
                    record.cron_expression,
                    record.interval_ms,
                    record.executed_at,
                    record.last_error,
                    record.retry_count,
                ],
            )?;
            Ok(())
        })
    }

    fn get_all(&self) -> Result<Vec<JobRecord>> {
        self.with_conn(|conn| {
            let sql = format!("{SELECT_COLUMNS} ORDER BY schedule_time");
            Self::query_records(conn, &sql, &[])
        })
    }

    fn get_due(&self, upto: Millis) -> Result<Vec<JobRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE status = 'pending' AND schedule_time <= ?1
                 ORDER BY schedule_time"
            );
            Self::query_records(conn, &sql, &[&upto])
        })
    }

    fn update_fields(&self, id: &str, fields: &FieldUpdate) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(status) = fields.status {
            columns.push("status");
            values.push(SqlValue::Text(status.to_string()));
        }
        if let Some(executed_at) = fields.executed_at {
            columns.push("executed_at");
            values.push(executed_at.map_or(SqlValue::Null, SqlValue::Integer));
        }
        if let Some(last_error) = &fields.last_error {
            columns.push("last_error");
            values.push(last_error.clone().map_or(SqlValue::Null, SqlValue::Text));
        }
        if let Some(count) = fields.retry_count {
            columns.push("retry_count");
            values.push(SqlValue::Integer(i64::from(count)));
        }

        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE jobs SET {} WHERE id = ?{}",
            assignments.join(", "),
            columns.len() + 1
        );
        values.push(SqlValue::Text(id.to_string()));

        self.with_conn(|conn| {
            let n = conn.execute(&sql, rusqlite::params_from_iter(values))?;
            if n == 0 {
                return Err(SchedulerError::Persistence(format!(
                    "job {id} is not mirrored"
                )));
            }
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let taken = self.conn.lock().expect("mirror connection poisoned").take();
        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| SchedulerError::from(e))?;
            info!("job mirror closed");
        }
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        schedule_time: row.get(1)?,
        handler_name: row.get(2)?,
        data: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        retry_strategy: row.get(6)?,
        recurring: row.get(7)?,
        cron_expression: row.get(8)?,
        interval_ms: row.get(9)?,
        executed_at: row.get(10)?,
        last_error: row.get(11)?,
        retry_count: row.get(12)?,
    })
}
