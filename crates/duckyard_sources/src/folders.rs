//! Folder sources: registered local directories scanned for CSV/Parquet files.

use crate::credentials::normalize_local_path;
use crate::error::{Result, SourceError};
use crate::patterns::{build_name_matcher, name_matches};
use crate::registry::validate_source_name;
use crate::service::SourceService;
use crate::types::{AllowedTypes, FolderFile, FolderScanResult, FolderSource};
use duckyard_db::{millis_to_datetime, now_millis};
use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Default cap on files returned by a listing.
pub const DEFAULT_FILE_LIMIT: usize = 500;
/// Default cap on files considered by a scan.
pub const DEFAULT_SCAN_LIMIT: usize = 5000;

impl SourceService {
    /// Register `path` under `name`, or update the registration with that name.
    pub fn create_folder_source(
        &self,
        name: &str,
        path: &str,
        allowed_types: AllowedTypes,
        pattern: Option<&str>,
    ) -> Result<FolderSource> {
        validate_source_name(name)?;
        let cleaned = normalize_local_path(path);
        let dir = Path::new(&cleaned);
        if !dir.exists() {
            return Err(SourceError::validation(format!("Path does not exist: {}", cleaned)));
        }
        if !dir.is_dir() {
            return Err(SourceError::validation(format!("Path is not a directory: {}", cleaned)));
        }
        let resolved = std::fs::canonicalize(dir)?.display().to_string();
        let pattern = pattern.map(str::trim).filter(|p| !p.is_empty());
        build_name_matcher(pattern)?;

        self.connect(|registry| {
            let id = registry.upsert_folder(name, &resolved, allowed_types, pattern, self.project_id())?;
            info!(folder = name, path = %resolved, "registered folder source");
            registry
                .get_folder(&id, self.project_id())?
                .ok_or_else(|| SourceError::SourceNotFound(id.clone()))
        })
    }

    pub fn list_folder_sources(&self) -> Result<Vec<FolderSource>> {
        self.connect(|registry| registry.list_folders(self.project_id()))
    }

    pub fn get_folder_source(&self, folder_id: &str) -> Result<Option<FolderSource>> {
        self.connect(|registry| registry.get_folder(folder_id, self.project_id()))
    }

    /// Remove the registration; files on disk are untouched.
    pub fn delete_folder_source(&self, folder_id: &str) -> Result<bool> {
        self.connect(|registry| registry.delete_folder(folder_id, self.project_id()))
    }

    /// Current matching files, newest first.
    pub fn list_folder_files(&self, folder_id: &str, limit: Option<usize>) -> Result<Vec<FolderFile>> {
        let folder = self
            .get_folder_source(folder_id)?
            .ok_or_else(|| SourceError::SourceNotFound(folder_id.to_string()))?;
        list_directory(
            Path::new(&folder.path),
            folder.allowed_types,
            folder.pattern.as_deref(),
            limit.unwrap_or(DEFAULT_FILE_LIMIT),
        )
    }

    pub fn scan_folder_source(&self, folder_id: &str) -> Result<FolderScanResult> {
        self.scan_folder_source_with_limit(folder_id, DEFAULT_SCAN_LIMIT)
    }

    /// Diff a fresh listing against the last snapshot, then store the listing
    /// as the new snapshot whether or not anything changed.
    pub fn scan_folder_source_with_limit(&self, folder_id: &str, limit: usize) -> Result<FolderScanResult> {
        self.connect(|registry| {
            let folder = registry
                .get_folder(folder_id, self.project_id())?
                .ok_or_else(|| SourceError::SourceNotFound(folder_id.to_string()))?;
            let previous = registry.load_snapshot(folder_id, self.project_id())?;
            let current = list_directory(
                Path::new(&folder.path),
                folder.allowed_types,
                folder.pattern.as_deref(),
                limit,
            )?;

            let delta = diff_snapshots(&previous, &current);
            let scanned_at = now_millis();
            registry.save_snapshot(folder_id, self.project_id(), &current, scanned_at)?;
            info!(
                folder = %folder.name,
                new = delta.new.len(),
                changed = delta.changed.len(),
                deleted = delta.deleted.len(),
                "scanned folder"
            );

            Ok(FolderScanResult {
                folder_id: folder_id.to_string(),
                scanned_at: millis_to_datetime(scanned_at),
                new_files: delta.new.len(),
                changed_files: delta.changed.len(),
                deleted_files: delta.deleted.len(),
                new_file_paths: delta.new,
                changed_file_paths: delta.changed,
                deleted_file_paths: delta.deleted,
            })
        })
    }
}

/// Paths sorted into the three change classes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SnapshotDelta {
    pub new: Vec<String>,
    pub changed: Vec<String>,
    pub deleted: Vec<String>,
}

/// Three-way diff keyed by path; a file changed when size or mtime differ.
pub fn diff_snapshots(previous: &[FolderFile], current: &[FolderFile]) -> SnapshotDelta {
    let before: HashMap<&str, &FolderFile> = previous.iter().map(|f| (f.path.as_str(), f)).collect();
    let after: HashMap<&str, &FolderFile> = current.iter().map(|f| (f.path.as_str(), f)).collect();

    let mut delta = SnapshotDelta::default();
    for file in current {
        match before.get(file.path.as_str()) {
            None => delta.new.push(file.path.clone()),
            Some(old) if old.size_bytes != file.size_bytes || old.modified_at != file.modified_at => {
                delta.changed.push(file.path.clone())
            }
            Some(_) => {}
        }
    }
    for file in previous {
        if !after.contains_key(file.path.as_str()) {
            delta.deleted.push(file.path.clone());
        }
    }
    delta
}

/// Non-recursive listing of `dir` filtered by extension and name pattern,
/// newest mtime first. A missing directory lists as empty.
pub fn list_directory(
    dir: &Path,
    allowed_types: AllowedTypes,
    pattern: Option<&str>,
    limit: usize,
) -> Result<Vec<FolderFile>> {
    if !dir.is_dir() {
        debug!(path = %dir.display(), "folder missing, listing nothing");
        return Ok(Vec::new());
    }
    let matcher = build_name_matcher(pattern)?;
    let extensions = allowed_types.extensions();

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let extension = match entry.path().extension() {
            Some(ext) => ext.to_string_lossy().to_lowercase(),
            None => continue,
        };
        if !extensions.contains(&extension.as_str()) || !name_matches(matcher.as_ref(), &name) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        files.push(FolderFile {
            path: entry.path().display().to_string(),
            name,
            file_type: extension,
            size_bytes: metadata.len(),
            modified_at,
        });
    }

    files.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then_with(|| a.name.cmp(&b.name)));
    files.truncate(limit);
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use tempfile::TempDir;

    fn file(path: &str, size: u64, mtime: i64) -> FolderFile {
        FolderFile {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            file_type: "csv".to_string(),
            size_bytes: size,
            modified_at: mtime,
        }
    }

    #[test]
    fn diff_classifies_three_ways() {
        let previous = vec![file("/d/a.csv", 1, 10), file("/d/b.csv", 2, 20), file("/d/c.csv", 3, 30)];
        let current = vec![file("/d/b.csv", 2, 21), file("/d/c.csv", 3, 30), file("/d/e.csv", 5, 50)];
        let delta = diff_snapshots(&previous, &current);
        assert_eq!(delta.new, vec!["/d/e.csv".to_string()]);
        assert_eq!(delta.changed, vec!["/d/b.csv".to_string()]);
        assert_eq!(delta.deleted, vec!["/d/a.csv".to_string()]);
        assert_eq!(diff_snapshots(&current, &current), SnapshotDelta::default());
    }

    #[test]
    fn listing_filters_and_orders() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::write(root.join("old.csv"), "a\n1\n").unwrap();
        fs::write(root.join("new.CSV"), "a\n1\n").unwrap();
        fs::write(root.join("data.parquet"), b"PAR1").unwrap();
        fs::write(root.join("notes.txt"), "x").unwrap();
        fs::create_dir(root.join("nested")).unwrap();
        fs::write(root.join("nested").join("deep.csv"), "a\n").unwrap();
        set_file_mtime(root.join("old.csv"), FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
        set_file_mtime(root.join("new.CSV"), FileTime::from_unix_time(1_700_000_000, 0)).unwrap();

        let csv = list_directory(root, AllowedTypes::Csv, None, 10).unwrap();
        let names: Vec<_> = csv.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["new.CSV", "old.csv"]);
        assert_eq!(csv[0].modified_at, 1_700_000_000_000);

        let both = list_directory(root, AllowedTypes::Both, None, 10).unwrap();
        assert_eq!(both.len(), 3);

        let limited = list_directory(root, AllowedTypes::Both, None, 1).unwrap();
        assert_eq!(limited.len(), 1);

        let patterned = list_directory(root, AllowedTypes::Both, Some("old*"), 10).unwrap();
        assert_eq!(patterned.len(), 1);
        assert_eq!(patterned[0].name, "old.csv");

        assert!(list_directory(&root.join("absent"), AllowedTypes::Both, None, 10)
            .unwrap()
            .is_empty());
    }
}
