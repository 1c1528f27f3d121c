//! DuckDB warehouse access for duckyard.
//!
//! One project owns one DuckDB file. Access goes through [`Warehouse`],
//! which serializes connect-execute-close cycles per file and enforces a
//! single writer process through a lock file.

pub mod backend;
pub mod ident;
pub mod lock;
pub mod sql_guard;
pub mod warehouse;

pub use backend::{BackendError, DbConnection, DbRow, DbTransaction, DbValue, FromDbValue, QueryResult};
pub use ident::{is_valid_identifier, quote_ident, quote_ident_path, quote_literal, sanitize_identifier};
pub use lock::{lock_path_for, WarehouseLock};
pub use sql_guard::{validate_filter, validate_read_only, SqlGuardError};
pub use warehouse::Warehouse;

/// Current wall-clock time as epoch milliseconds, the storage format for
/// every timestamp column.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert stored epoch milliseconds back to a UTC timestamp.
pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
