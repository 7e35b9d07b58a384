//! Statement execution
//!
//! The only path by which the identity layer touches persistent storage.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::{FromSql, Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::error::{LoaderError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One flat result row.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl SqlRow {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Typed column value; decoding failures are integrity errors.
    pub fn get<T: FromSql>(&self, index: usize) -> Result<T> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| LoaderError::Integrity(format!("row has no column {}", index)))?;
        T::column_result(ValueRef::from(value))
            .map_err(|e| LoaderError::Integrity(format!("column {} ({}): {}", index, self.column_name(index), e)))
    }

    pub fn get_by_name<T: FromSql>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| LoaderError::Integrity(format!("row has no column '{}'", name)))?;
        self.get(index)
    }

    fn column_name(&self, index: usize) -> &str {
        self.columns.get(index).map(String::as_str).unwrap_or("?")
    }
}

/// A statement plus its positional parameters, for batch execution.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl BatchStatement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self { sql: sql.into(), params }
    }
}

/// Execution capability consumed by the identity layer.
pub trait SqlExecutor: Send + Sync {
    /// Run a parameterless statement (DDL or DML); returns affected rows.
    fn execute_statement(&self, sql: &str) -> Result<usize>;

    /// Run a statement with positional parameters; returns affected rows.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize>;

    /// Run all statements in one transaction; nothing is applied on failure.
    fn execute_transactional_batch(&self, statements: &[BatchStatement]) -> Result<usize>;

    /// First column of the first row, if any row matched.
    fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>>;

    fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>>;
}

/// SQLite-backed executor. One connection, serialized by a mutex.
pub struct SqliteExecutor {
    conn: Mutex<Connection>,
}

impl SqliteExecutor {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| LoaderError::Configuration("SQLite connection poisoned".into()))?;
        f(&mut conn)
    }
}

impl SqlExecutor for SqliteExecutor {
    fn execute_statement(&self, sql: &str) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute(sql, [])?))
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute(sql, params_from_iter(params.iter()))?))
    }

    fn execute_transactional_batch(&self, statements: &[BatchStatement]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut affected = 0;
            for statement in statements {
                affected += tx.execute(&statement.sql, params_from_iter(statement.params.iter()))?;
            }
            tx.commit()?;
            debug!("Committed batch of {} statements ({} rows)", statements.len(), affected);
            Ok(affected)
        })
    }

    fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, Value>(0)?)),
                None => Ok(None),
            }
        })
    }

    fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Arc<[String]> = stmt.column_names().into_iter().map(String::from).collect();
            let width = columns.len();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(row.get::<_, Value>(i)?);
                }
                out.push(SqlRow::new(columns.clone(), values));
            }
            Ok(out)
        })
    }
}
