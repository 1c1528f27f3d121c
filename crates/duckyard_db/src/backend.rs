//! DuckDB connection wrapper.
//!
//! Synchronous, single-connection access to a project warehouse.
//! - Typed parameter/row values (`DbValue`, `DbRow`)
//! - Single-writer enforced via file lock
//! - Every statement traced under a `db.*` span

use crate::lock::WarehouseLock;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, debug_span};

/// Errors from database backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database is locked by another process: {0}")]
    Locked(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),
}

/// Value type for query parameters and result cells.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
    Timestamp(chrono::DateTime<chrono::Utc>),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// JSON rendering used by previews and CLI output.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DbValue::Null => serde_json::Value::Null,
            DbValue::Integer(v) => serde_json::Value::from(*v),
            DbValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            DbValue::Text(v) => serde_json::Value::String(v.clone()),
            DbValue::Blob(v) => serde_json::Value::String(format!("<{} bytes>", v.len())),
            DbValue::Boolean(v) => serde_json::Value::Bool(*v),
            DbValue::Timestamp(v) => serde_json::Value::String(v.to_rfc3339()),
        }
    }
}

impl std::fmt::Display for DbValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbValue::Null => write!(f, "NULL"),
            DbValue::Integer(v) => write!(f, "{}", v),
            DbValue::Real(v) => write!(f, "{}", v),
            DbValue::Text(v) => write!(f, "{}", v),
            DbValue::Blob(v) => write!(f, "<{} bytes>", v.len()),
            DbValue::Boolean(v) => write!(f, "{}", v),
            DbValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Integer(v as i64)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<&String> for DbValue {
    fn from(v: &String) -> Self {
        DbValue::Text(v.clone())
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(v: Vec<u8>) -> Self {
        DbValue::Blob(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DbValue::Null,
        }
    }
}

/// Row data from a query result.
#[derive(Debug, Clone)]
pub struct DbRow {
    columns: Rc<Vec<String>>,
    values: Vec<DbValue>,
}

impl DbRow {
    fn new(columns: Rc<Vec<String>>, values: Vec<DbValue>) -> Self {
        Self { columns, values }
    }

    /// Get a value by column index.
    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T, BackendError> {
        self.values
            .get(index)
            .ok_or_else(|| {
                BackendError::TypeConversion(format!("Column index {} out of bounds", index))
            })
            .and_then(|v| T::from_db_value(v))
    }

    /// Get a value by column name.
    pub fn get_by_name<T: FromDbValue>(&self, name: &str) -> Result<T, BackendError> {
        let index =
            self.columns.iter().position(|c| c == name).ok_or_else(|| {
                BackendError::TypeConversion(format!("Column '{}' not found", name))
            })?;
        self.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[DbValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<DbValue> {
        self.values
    }
}

/// Column names plus rows, kept even when the result is empty.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<DbRow>,
}

/// Trait for converting from DbValue.
pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError>;
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            DbValue::Null => Err(BackendError::TypeConversion(
                "i64 field is NULL - use Option<i64> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected integer".to_string())),
        }
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            DbValue::Null => Err(BackendError::TypeConversion(
                "f64 field is NULL - use Option<f64> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected real".to_string())),
        }
    }
}

impl FromDbValue for String {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Text(v) => Ok(v.clone()),
            DbValue::Null => Err(BackendError::TypeConversion(
                "String field is NULL - use Option<String> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected text".to_string())),
        }
    }
}

impl FromDbValue for bool {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Boolean(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v != 0),
            DbValue::Null => Err(BackendError::TypeConversion(
                "bool field is NULL - use Option<bool> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected boolean".to_string())),
        }
    }
}

impl FromDbValue for DbValue {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        Ok(value.clone())
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Null => Ok(None),
            _ => T::from_db_value(value).map(Some),
        }
    }
}

/// A single warehouse connection.
///
/// Not `Send`: a connection lives inside the operation that opened it.
pub struct DbConnection {
    conn: Rc<duckdb::Connection>,
    /// Released when the connection drops; `None` for in-memory databases.
    lock: Option<WarehouseLock>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("backend", &"DuckDB")
            .field("lock", &self.lock.as_ref().map(WarehouseLock::path))
            .finish()
    }
}

impl DbConnection {
    /// Open a DuckDB database with exclusive write lock.
    ///
    /// DuckDB only allows one writer process at a time. This function acquires
    /// an exclusive lock before opening the database.
    pub fn open_duckdb(path: &Path) -> Result<Self, BackendError> {
        let lock = WarehouseLock::acquire(path)?;
        let conn = Rc::new(duckdb::Connection::open(path)?);
        debug!("Opened DuckDB warehouse: {}", path.display());

        Ok(Self {
            conn,
            lock: Some(lock),
        })
    }

    /// Open an in-memory DuckDB database (for testing).
    pub fn open_duckdb_memory() -> Result<Self, BackendError> {
        let conn = Rc::new(duckdb::Connection::open_in_memory()?);
        debug!("Opened in-memory DuckDB database");

        Ok(Self { conn, lock: None })
    }

    /// Execute a SQL statement (no results). Returns the affected row count.
    pub fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        execute_on_conn(self.conn.as_ref(), sql, params)
    }

    /// Execute a batch of SQL statements.
    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        execute_batch_on_conn(self.conn.as_ref(), sql)
    }

    /// Query and return all rows.
    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query_on_conn(self.conn.as_ref(), sql, params).map(|r| r.rows)
    }

    /// Query and return rows together with the column names.
    pub fn query_with_columns(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<QueryResult, BackendError> {
        query_on_conn(self.conn.as_ref(), sql, params)
    }

    /// Query and return the first row, if any.
    pub fn query_optional(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        let rows = self.query_all(sql, params)?;
        Ok(rows.into_iter().next())
    }

    /// Query and return exactly one row.
    pub fn query_one(&self, sql: &str, params: &[DbValue]) -> Result<DbRow, BackendError> {
        self.query_optional(sql, params)?
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))
    }

    /// Query and return a single scalar value.
    pub fn query_scalar<T: FromDbValue>(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        let row = self.query_one(sql, params)?;
        row.get(0)
    }

    /// Run `op` inside BEGIN/COMMIT, rolling back on error.
    pub fn transaction<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: for<'a> FnOnce(&'a mut DbTransaction<'a>) -> Result<T, BackendError>,
    {
        self.conn.execute_batch("BEGIN")?;
        let mut tx = DbTransaction {
            conn: self.conn.as_ref(),
        };
        let result = op(&mut tx);

        match result {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => match self.conn.execute_batch("ROLLBACK") {
                Ok(()) => Err(err),
                Err(rollback_err) => Err(BackendError::Transaction(format!(
                    "Transaction failed: {}; rollback failed: {}",
                    err, rollback_err
                ))),
            },
        }
    }
}

/// Transaction wrapper for DuckDB.
pub struct DbTransaction<'a> {
    conn: &'a duckdb::Connection,
}

impl<'a> DbTransaction<'a> {
    pub fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        execute_on_conn(self.conn, sql, params)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<(), BackendError> {
        execute_batch_on_conn(self.conn, sql)
    }

    pub fn query_scalar<T: FromDbValue>(
        &mut self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        let result = query_on_conn(self.conn, sql, params)?;
        result
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))?
            .get(0)
    }
}

fn execute_on_conn(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<u64, BackendError> {
    let op = sql_op_name(sql);
    let sql_hash = hash_sql(sql);
    let span = debug_span!(
        "db.exec",
        op = op,
        sql_hash = %sql_hash,
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let duckdb_params = to_duckdb_params(params);
    let param_refs: Vec<&dyn duckdb::ToSql> = duckdb_params
        .iter()
        .map(|v| v as &dyn duckdb::ToSql)
        .collect();
    let rows = stmt.execute(param_refs.as_slice())?;
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(rows as u64)
}

fn execute_batch_on_conn(conn: &duckdb::Connection, sql: &str) -> Result<(), BackendError> {
    let sql_hash = hash_sql(sql);
    let span = debug_span!(
        "db.exec_batch",
        op = "BATCH",
        sql_hash = %sql_hash,
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();
    conn.execute_batch(sql)?;
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(())
}

fn query_on_conn(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<QueryResult, BackendError> {
    let op = sql_op_name(sql);
    let sql_hash = hash_sql(sql);
    let span = debug_span!(
        "db.query",
        op = op,
        sql_hash = %sql_hash,
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let duckdb_params = to_duckdb_params(params);
    let param_refs: Vec<&dyn duckdb::ToSql> = duckdb_params
        .iter()
        .map(|v| v as &dyn duckdb::ToSql)
        .collect();

    let mut rows_iter = stmt.query(param_refs.as_slice())?;

    let columns: Vec<String> = match rows_iter.as_ref() {
        Some(stmt_ref) => (0..stmt_ref.column_count())
            .map(|i| {
                stmt_ref
                    .column_name(i)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| format!("col{}", i))
            })
            .collect(),
        None => return Ok(QueryResult::default()),
    };
    let shared_columns = Rc::new(columns.clone());
    let column_count = columns.len();

    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(duckdb_value_to_db_value(row, i)?);
        }
        rows.push(DbRow::new(Rc::clone(&shared_columns), values));
    }

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(QueryResult { columns, rows })
}

fn to_duckdb_params(params: &[DbValue]) -> Vec<duckdb::types::Value> {
    params
        .iter()
        .map(|p| match p {
            DbValue::Null => duckdb::types::Value::Null,
            DbValue::Integer(v) => duckdb::types::Value::BigInt(*v),
            DbValue::Real(v) => duckdb::types::Value::Double(*v),
            DbValue::Text(v) => duckdb::types::Value::Text(v.clone()),
            DbValue::Blob(v) => duckdb::types::Value::Blob(v.clone()),
            DbValue::Boolean(v) => duckdb::types::Value::Boolean(*v),
            DbValue::Timestamp(v) => duckdb::types::Value::Timestamp(
                duckdb::types::TimeUnit::Microsecond,
                v.timestamp_micros(),
            ),
        })
        .collect()
}

fn micros_for(unit: duckdb::types::TimeUnit, v: i64) -> Option<i64> {
    match unit {
        duckdb::types::TimeUnit::Second => v.checked_mul(1_000_000),
        duckdb::types::TimeUnit::Millisecond => v.checked_mul(1_000),
        duckdb::types::TimeUnit::Microsecond => Some(v),
        duckdb::types::TimeUnit::Nanosecond => Some(v / 1_000),
    }
}

/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Integer when it fits in i64, decimal text otherwise.
fn wide_integer<T>(v: T) -> DbValue
where
    T: Copy + ToString + TryInto<i64>,
{
    v.try_into()
        .map(DbValue::Integer)
        .unwrap_or_else(|_| DbValue::Text(v.to_string()))
}

fn date_value(days: i32) -> DbValue {
    // DuckDB encodes +/-infinity dates as +/-i32::MAX.
    match days {
        i32::MAX => return DbValue::Text("infinity".to_string()),
        d if d == -i32::MAX => return DbValue::Text("-infinity".to_string()),
        _ => {}
    }
    UNIX_EPOCH_DAYS_FROM_CE
        .checked_add(days)
        .and_then(chrono::NaiveDate::from_num_days_from_ce_opt)
        .map(|date| DbValue::Text(date.format("%Y-%m-%d").to_string()))
        .unwrap_or(DbValue::Integer(days as i64))
}

fn timestamp_value(unit: duckdb::types::TimeUnit, v: i64) -> DbValue {
    match v {
        i64::MAX => return DbValue::Text("infinity".to_string()),
        x if x == -i64::MAX => return DbValue::Text("-infinity".to_string()),
        _ => {}
    }
    match micros_for(unit, v).and_then(chrono::DateTime::from_timestamp_micros) {
        Some(dt) => DbValue::Timestamp(dt),
        None => DbValue::Integer(v),
    }
}

fn time_value(unit: duckdb::types::TimeUnit, v: i64) -> DbValue {
    let Some(micros) = micros_for(unit, v) else {
        return DbValue::Integer(v);
    };
    let secs = u32::try_from(micros.div_euclid(1_000_000)).ok();
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok();
    match secs
        .zip(nanos)
        .and_then(|(s, n)| chrono::NaiveTime::from_num_seconds_from_midnight_opt(s, n))
    {
        Some(time) => DbValue::Text(time.format("%H:%M:%S%.6f").to_string()),
        None => DbValue::Integer(micros),
    }
}

fn duckdb_value_to_db_value(row: &duckdb::Row, index: usize) -> Result<DbValue, duckdb::Error> {
    use duckdb::types::ValueRef;

    match row.get_ref(index)? {
        ValueRef::Null => Ok(DbValue::Null),
        ValueRef::Boolean(v) => Ok(DbValue::Boolean(v)),
        ValueRef::TinyInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::SmallInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::Int(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::BigInt(v) => Ok(DbValue::Integer(v)),
        ValueRef::HugeInt(v) => Ok(wide_integer(v)),
        ValueRef::UTinyInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::USmallInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::UInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::UBigInt(v) => Ok(wide_integer(v)),
        ValueRef::Float(v) => Ok(DbValue::Real(v as f64)),
        ValueRef::Double(v) => Ok(DbValue::Real(v)),
        ValueRef::Decimal(v) => Ok(v
            .to_string()
            .parse::<f64>()
            .map(DbValue::Real)
            .unwrap_or_else(|_| DbValue::Text(v.to_string()))),
        ValueRef::Text(v) => Ok(DbValue::Text(String::from_utf8_lossy(v).to_string())),
        ValueRef::Blob(v) => Ok(DbValue::Blob(v.to_vec())),
        ValueRef::Timestamp(unit, v) => Ok(timestamp_value(unit, v)),
        ValueRef::Date32(days) => Ok(date_value(days)),
        ValueRef::Time64(unit, v) => Ok(time_value(unit, v)),
        ValueRef::Interval {
            months,
            days,
            nanos,
        } => Ok(DbValue::Text(format!("P{}M{}DT{}N", months, days, nanos))),
        other => {
            tracing::warn!(
                "DuckDB type {:?} at column {} mapped to debug string",
                std::mem::discriminant(&other),
                index
            );
            Ok(DbValue::Text(format!("{:?}", other)))
        }
    }
}

fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

fn hash_sql(sql: &str) -> String {
    // FNV-1a 64-bit hash for low-cardinality, stable identification.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in sql.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_with_columns_keeps_columns_for_empty_result() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT, name TEXT)")
            .unwrap();

        let result = conn.query_with_columns("SELECT * FROM t", &[]).unwrap();
        assert_eq!(result.columns, vec!["id".to_string(), "name".to_string()]);
        assert!(result.rows.is_empty());
    }

    #[test]
    fn out_of_range_values_do_not_truncate() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let row = conn
            .query_one(
                "SELECT 'infinity'::DATE, '-infinity'::DATE, DATE '2024-02-29', \
                 18446744073709551615::UBIGINT, 42::UBIGINT, \
                 100000000000000000000::HUGEINT, \
                 'infinity'::TIMESTAMP",
                &[],
            )
            .unwrap();
        let values = row.values();
        assert_eq!(values[0], DbValue::Text("infinity".to_string()));
        assert_eq!(values[1], DbValue::Text("-infinity".to_string()));
        assert_eq!(values[2], DbValue::Text("2024-02-29".to_string()));
        assert_eq!(values[3], DbValue::Text("18446744073709551615".to_string()));
        assert_eq!(values[4], DbValue::Integer(42));
        assert_eq!(
            values[5],
            DbValue::Text("100000000000000000000".to_string())
        );
        assert_eq!(values[6], DbValue::Text("infinity".to_string()));
    }

    #[test]
    fn params_round_trip_through_rows() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT, name TEXT, note TEXT)")
            .unwrap();
        let inserted = conn
            .execute(
                "INSERT INTO t VALUES (?, ?, ?)",
                &[
                    DbValue::from(7_i64),
                    DbValue::from("alpha"),
                    DbValue::from(None::<String>),
                ],
            )
            .unwrap();
        assert_eq!(inserted, 1);

        let row = conn.query_one("SELECT id, name, note FROM t", &[]).unwrap();
        assert_eq!(row.get_by_name::<i64>("id").unwrap(), 7);
        assert_eq!(row.get::<String>(1).unwrap(), "alpha");
        assert_eq!(row.get::<Option<String>>(2).unwrap(), None);
        assert!(row.get::<String>(2).is_err());
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT)").unwrap();

        let result: Result<(), BackendError> = conn.transaction(|tx| {
            tx.execute("INSERT INTO t VALUES (1)", &[])?;
            Err(BackendError::InvalidInput("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn json_rendering_of_values() {
        assert_eq!(DbValue::Null.to_json(), serde_json::Value::Null);
        assert_eq!(DbValue::Integer(3).to_json(), serde_json::json!(3));
        assert_eq!(DbValue::from("x").to_json(), serde_json::json!("x"));
        assert_eq!(DbValue::Real(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn hash_sql_is_stable() {
        assert_eq!(hash_sql("SELECT 1"), hash_sql("SELECT 1"));
        assert_ne!(hash_sql("SELECT 1"), hash_sql("SELECT 2"));
        assert_eq!(sql_op_name("  insert into t"), "insert");
    }
}
