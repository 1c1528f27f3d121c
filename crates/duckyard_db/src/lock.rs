//! Cross-process single-writer lock for a warehouse file.
//!
//! The lock is an exclusive `fs2` lock on `<warehouse>.lock`. The holder
//! writes its pid and acquisition time into that file, so a process that is
//! turned away can say who holds the warehouse.

use crate::backend::BackendError;
use crate::now_millis;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// `<warehouse>.lock` next to the warehouse file.
pub fn lock_path_for(warehouse: &Path) -> PathBuf {
    let mut name = warehouse.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at: i64,
}

/// Exclusive hold on a warehouse; released on drop.
#[derive(Debug)]
pub struct WarehouseLock {
    file: File,
    path: PathBuf,
}

impl WarehouseLock {
    /// Take the lock without blocking. Another holder gives
    /// `BackendError::Locked` naming the warehouse and, when readable, the
    /// holder's pid.
    pub fn acquire(warehouse: &Path) -> Result<Self, BackendError> {
        let path = lock_path_for(warehouse);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| BackendError::Database(format!("Lock file {}: {}", path.display(), e)))?;

        // Fully qualified: std::fs::File grew its own try_lock_exclusive in 1.89.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let holder = read_holder(&mut file)
                    .map(|h| format!(" (held by pid {})", h.pid))
                    .unwrap_or_default();
                return Err(BackendError::Locked(format!("{}{}", warehouse.display(), holder)));
            }
            Err(e) => {
                return Err(BackendError::Database(format!(
                    "Lock acquire {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        if let Err(e) = write_holder(&mut file) {
            debug!(path = %path.display(), error = %e, "could not record lock holder");
        }
        debug!(path = %path.display(), "warehouse lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WarehouseLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "warehouse unlock failed");
        }
        debug!(path = %self.path.display(), "warehouse lock released");
    }
}

fn write_holder(file: &mut File) -> io::Result<()> {
    let holder = LockHolder {
        pid: std::process::id(),
        acquired_at: now_millis(),
    };
    let payload = serde_json::to_vec(&holder).map_err(io::Error::other)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&payload)?;
    file.flush()
}

fn read_holder(file: &mut File) -> Option<LockHolder> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut raw).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn lock_file_sits_next_to_the_warehouse() {
        assert_eq!(
            lock_path_for(Path::new("/data/warehouse.duckdb")),
            PathBuf::from("/data/warehouse.duckdb.lock")
        );
        assert_eq!(lock_path_for(Path::new("/data/mydb")), PathBuf::from("/data/mydb.lock"));
    }

    #[test]
    fn holder_is_recorded_and_cleared_on_release() {
        let temp = TempDir::new().unwrap();
        let warehouse = temp.path().join("warehouse.duckdb");

        let lock = WarehouseLock::acquire(&warehouse).unwrap();
        let holder: LockHolder =
            serde_json::from_str(&fs::read_to_string(lock.path()).unwrap()).unwrap();
        assert_eq!(holder.pid, std::process::id());

        let lock_path = lock.path().to_path_buf();
        drop(lock);
        assert_eq!(fs::read_to_string(&lock_path).unwrap(), "");
        assert!(WarehouseLock::acquire(&warehouse).is_ok());
    }

    #[test]
    fn second_holder_is_turned_away_with_the_pid() {
        let temp = TempDir::new().unwrap();
        let warehouse = temp.path().join("warehouse.duckdb");

        let _held = WarehouseLock::acquire(&warehouse).unwrap();
        match WarehouseLock::acquire(&warehouse) {
            Err(BackendError::Locked(message)) => {
                assert!(message.contains("warehouse.duckdb"));
                assert!(message.contains(&format!("pid {}", std::process::id())));
            }
            other => panic!("expected Locked, got {:?}", other.map(|l| l.path().to_path_buf())),
        }
    }
}
