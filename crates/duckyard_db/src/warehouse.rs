//! Serialized access to a project warehouse file.
//!
//! DuckDB does not tolerate unserialized writers on one file, so every
//! connect-execute-close cycle for a path runs under that path's mutex.

use crate::backend::{BackendError, DbConnection};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

type PathLock = Arc<ReentrantMutex<()>>;

static WAREHOUSE_LOCKS: Lazy<Mutex<HashMap<PathBuf, PathLock>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> PathLock {
    let mut locks = WAREHOUSE_LOCKS.lock();
    Arc::clone(
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(ReentrantMutex::new(()))),
    )
}

/// Handle to one project's DuckDB file.
///
/// Cheap to clone; holds no connection. Connections exist only for the
/// duration of a [`Warehouse::with_connection`] call.
#[derive(Debug, Clone)]
pub struct Warehouse {
    path: PathBuf,
}

impl Warehouse {
    /// Create a handle, creating the parent directory if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| {
            BackendError::Database(format!(
                "Failed to create warehouse directory {}: {}",
                parent.display(),
                e
            ))
        })?;
        let file_name = path.file_name().ok_or_else(|| {
            BackendError::InvalidInput(format!("Warehouse path has no file name: {}", path.display()))
        })?;
        let parent = fs::canonicalize(&parent).map_err(|e| {
            BackendError::Database(format!("Failed to resolve {}: {}", parent.display(), e))
        })?;
        Ok(Self {
            path: parent.join(file_name),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the warehouse file.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Open a connection, run `op`, close the connection.
    ///
    /// The path mutex is held for the whole cycle and the connection is
    /// dropped before it is released, on both success and error. The mutex
    /// is reentrant: a nested call for the same path on the same thread gets
    /// `BackendError::Locked` from the file lock instead of deadlocking.
    pub fn with_connection<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&DbConnection) -> Result<T, E>,
        E: From<BackendError>,
    {
        let lock = lock_for(&self.path);
        let _serialized = lock.lock();
        debug!(path = %self.path.display(), "warehouse connection opened");
        let conn = DbConnection::open_duckdb(&self.path)?;
        let result = op(&conn);
        drop(conn);
        debug!(path = %self.path.display(), "warehouse connection closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn open_creates_parent_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("projects").join("p1").join("warehouse.duckdb");
        let warehouse = Warehouse::open(&path).unwrap();
        assert!(warehouse.dir().exists());
        assert!(warehouse.path().ends_with("warehouse.duckdb"));
    }

    #[test]
    fn with_connection_persists_between_calls() {
        let temp = TempDir::new().unwrap();
        let warehouse = Warehouse::open(temp.path().join("w.duckdb")).unwrap();

        warehouse
            .with_connection(|conn| conn.execute_batch("CREATE TABLE t (id BIGINT); INSERT INTO t VALUES (1)"))
            .unwrap();
        let count: i64 = warehouse
            .with_connection(|conn| conn.query_scalar("SELECT COUNT(*) FROM t", &[]))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn error_in_operation_releases_the_lock() {
        let temp = TempDir::new().unwrap();
        let warehouse = Warehouse::open(temp.path().join("w.duckdb")).unwrap();

        let failed: Result<(), BackendError> =
            warehouse.with_connection(|conn| conn.execute_batch("SELECT * FROM missing_table"));
        assert!(failed.is_err());

        let value: i64 = warehouse
            .with_connection(|conn| conn.query_scalar("SELECT 42", &[]))
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn nested_open_on_same_path_reports_locked() {
        let temp = TempDir::new().unwrap();
        let warehouse = Warehouse::open(temp.path().join("w.duckdb")).unwrap();
        let inner = warehouse.clone();

        let result: Result<(), BackendError> = warehouse.with_connection(|_outer| {
            inner.with_connection(|_conn| Ok::<(), BackendError>(()))
        });
        assert!(matches!(result, Err(BackendError::Locked(_))));
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let temp = TempDir::new().unwrap();
        let warehouse = Warehouse::open(temp.path().join("w.duckdb")).unwrap();
        warehouse
            .with_connection(|conn| conn.execute_batch("CREATE TABLE t (id BIGINT)"))
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let w = warehouse.clone();
                thread::spawn(move || {
                    w.with_connection(|conn| {
                        conn.execute("INSERT INTO t VALUES (?)", &[i.into()])
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let count: i64 = warehouse
            .with_connection(|conn| conn.query_scalar("SELECT COUNT(*) FROM t", &[]))
            .unwrap();
        assert_eq!(count, 4);
    }
}
